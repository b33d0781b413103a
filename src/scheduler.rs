//! Write Scheduler: drains pending egress bytes into the QUIC connection,
//! one stream at a time, in registry-insertion order.
//!
//! This is "work-conserving but not fair": a stream with a deep backlog can
//! hold the loop as long as it keeps accepting bytes, the same way quiche's
//! own `stream_send` does no inter-stream balancing on its own. Fairness
//! across many concurrent streams is out of scope -- this server only ever
//! drives one connection at a time.

use tokio_quiche::quic::QuicheConnection;
use tokio_quiche::quiche;

use crate::registry::{Registry, StreamKind};
use crate::stream_id::StreamId;

/// The amount of payload handed to `stream_send` in one call. quiche itself
/// fragments this further to fit the path MTU; this just bounds how much of
/// one stream's backlog we hand over before checking whether another stream
/// is also waiting.
const MAX_CHUNK: usize = 1200;

/// An upper bound on scheduler iterations per `process_writes` call, purely
/// to guarantee termination if a stream somehow never reports `Done` or
/// blocks -- not expected to ever bind in practice.
const MAX_ITERATIONS: usize = 4096;

/// Drain every stream with pending data or an owed FIN. Returns the number
/// of streams that made progress this round.
pub fn drive_writes(qconn: &mut QuicheConnection, registry: &mut Registry) -> quiche::Result<usize> {
    let mut progressed = 0;

    for _ in 0..MAX_ITERATIONS {
        let Some(stream_id) = registry.next_writable() else {
            break;
        };

        match write_one(qconn, registry, stream_id)? {
            WriteOutcome::Progressed => progressed += 1,
            WriteOutcome::Blocked => {
                // This stream can't take more right now; since
                // `next_writable` always returns the same front-of-queue
                // stream while it's marked writable, a blocked stream would
                // spin the loop forever. Temporarily drop it from
                // consideration for this round.
                break;
            }
            WriteOutcome::Done => {}
        }

        // A raw-echo stream is fully drained once its FIN has gone out;
        // per the documented lifecycle it's removed right here rather than
        // waiting for the transport to report a separate close event.
        if let Some(stream) = registry.get(stream_id) {
            if stream.kind == StreamKind::RawEcho && stream.fin_sent {
                registry.remove(stream_id);
            }
        }
    }

    Ok(progressed)
}

enum WriteOutcome {
    Progressed,
    Blocked,
    Done,
}

fn write_one(
    qconn: &mut QuicheConnection,
    registry: &mut Registry,
    stream_id: StreamId,
) -> quiche::Result<WriteOutcome> {
    let Some(stream) = registry.get_mut(stream_id) else {
        return Ok(WriteOutcome::Done);
    };

    if stream.has_pending() {
        let pending_len = stream.pending().len();
        let take = pending_len.min(MAX_CHUNK);
        let chunk = stream.pending()[..take].to_vec();
        let fin = take == pending_len && stream.fin_owed();

        match qconn.stream_send(stream_id.into(), &chunk, fin) {
            Ok(n) => {
                tracing::trace!(?stream_id, n, fin, "wrote stream data");
                let sent_whole_chunk = n == chunk.len();
                stream.advance_sendoff(n);
                if fin && sent_whole_chunk {
                    stream.fin_sent = true;
                }
                Ok(WriteOutcome::Progressed)
            }
            Err(quiche::Error::Done) => {
                // STREAM_DATA_BLOCKED equivalent: flow control or
                // congestion control has no room for this stream right now.
                Ok(WriteOutcome::Blocked)
            }
            Err(quiche::Error::StreamStopped(code)) => {
                // Peer sent STOP_SENDING; treat as a local shutdown of our
                // write side and stop trying to flush this stream.
                tracing::debug!(?stream_id, code, "peer stopped accepting stream data");
                stream.fin_sent = true;
                qconn.stream_shutdown(stream_id.into(), quiche::Shutdown::Write, code)?;
                Ok(WriteOutcome::Done)
            }
            Err(e) => Err(e),
        }
    } else if stream.fin_owed() {
        match qconn.stream_send(stream_id.into(), &[], true) {
            Ok(_) => {
                stream.fin_sent = true;
                Ok(WriteOutcome::Progressed)
            }
            Err(quiche::Error::Done) => Ok(WriteOutcome::Blocked),
            Err(quiche::Error::StreamStopped(code)) => {
                stream.fin_sent = true;
                qconn.stream_shutdown(stream_id.into(), quiche::Shutdown::Write, code)?;
                Ok(WriteOutcome::Done)
            }
            Err(e) => Err(e),
        }
    } else {
        Ok(WriteOutcome::Done)
    }
}
