//! Transport Binding + Connection Lifecycle: the single `ApplicationOverQuic`
//! implementation tying the stream registry and HTTP/3 engine to the
//! QUIC runtime's read/write/close callbacks.
//!
//! One `Driver` lives for exactly one connection; this server drives a
//! single connection to completion before accepting the next, so there is
//! never more than one `Driver` active at a time.

use tokio_quiche::buf_factory::{BufFactory, PooledBuf};
use tokio_quiche::metrics::Metrics;
use tokio_quiche::quic::{HandshakeInfo, QuicheConnection};
use tokio_quiche::quiche;
use tokio_quiche::{ApplicationOverQuic, BoxError, QuicResult};

use crate::error::ConnError;
use crate::h3;
use crate::registry::{Registry, StreamKind};
use crate::scheduler;
use crate::stream_id::StreamId;
use crate::tls::{ALPN_ECHO, ALPN_H3};

/// The negotiated application protocol for this connection, fixed once the
/// handshake completes.
enum Mode {
    /// ALPN not yet negotiated.
    Unestablished,
    /// `echo`: every byte received on every stream is echoed back verbatim.
    RawEcho,
    /// `h3`: HTTP/3 framing, QPACK headers, and WebTransport/WebSocket
    /// CONNECT dispatch.
    Http3(h3::Engine),
}

pub struct Driver {
    mode: Mode,
    registry: Registry,
    buf: PooledBuf,
    next_uni: StreamId,
    closed: Option<ConnError>,
    /// Signaled once [ApplicationOverQuic::on_conn_close] runs, so the
    /// accept loop can wait for this connection to fully finish before
    /// accepting the next one.
    done: Option<tokio::sync::oneshot::Sender<()>>,
}

impl Driver {
    pub fn new(done: tokio::sync::oneshot::Sender<()>) -> Self {
        Self {
            mode: Mode::Unestablished,
            registry: Registry::new(),
            buf: BufFactory::get_max_buf(),
            next_uni: StreamId::SERVER_UNI,
            closed: None,
            done: Some(done),
        }
    }

    fn fail(&mut self, err: ConnError) {
        tracing::warn!(error = %err, "connection driver failing");
        self.closed.get_or_insert(err);
    }

    fn read_stream(&mut self, qconn: &mut QuicheConnection, stream_id: StreamId) -> quiche::Result<()> {
        loop {
            let (len, fin) = match qconn.stream_recv(stream_id.into(), &mut self.buf) {
                Ok(v) => v,
                Err(quiche::Error::Done) => return Ok(()),
                Err(quiche::Error::StreamReset(code)) => {
                    tracing::debug!(?stream_id, code, "peer reset stream");
                    self.registry.remove(stream_id);
                    if let Mode::Http3(engine) = &mut self.mode {
                        engine.on_stream_closed(stream_id);
                    }
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let data = self.buf[..len].to_vec();
            self.dispatch(stream_id, &data, fin);

            if fin {
                return Ok(());
            }
        }
    }

    fn dispatch(&mut self, stream_id: StreamId, data: &[u8], fin: bool) {
        match &mut self.mode {
            Mode::RawEcho => {
                let stream = self.registry.get_or_insert(stream_id, StreamKind::RawEcho);
                stream.push_egress(data);
                if fin {
                    stream.fin_received = true;
                    stream.local_fin = true;
                }
            }
            Mode::Http3(engine) => {
                if stream_id.is_bi() {
                    if let Err(e) = engine.recv_stream_data(&mut self.registry, stream_id, data, fin) {
                        self.closed = Some(e);
                    }
                } else {
                    // Client-initiated unidirectional stream: the engine
                    // reads the leading type varint once per stream id and
                    // reassembles everything after it, so a SETTINGS frame
                    // split across reads is never misparsed as a fresh type
                    // byte. Only the control stream's SETTINGS frame is
                    // acted on; QPACK encoder/decoder streams are accepted
                    // but never produce dynamic-table instructions worth
                    // acting on in stateless mode.
                    if let Err(e) = engine.recv_uni_stream_data(stream_id, data) {
                        self.closed = Some(e);
                    }
                }
            }
            Mode::Unestablished => {
                tracing::warn!(?stream_id, "received stream data before handshake completed");
            }
        }
    }

    fn read_datagrams(&mut self, qconn: &mut QuicheConnection) -> quiche::Result<()> {
        loop {
            let len = match qconn.dgram_recv(&mut self.buf) {
                Ok(len) => len,
                Err(quiche::Error::Done) => return Ok(()),
                Err(e) => return Err(e),
            };

            // Echo the datagram back verbatim. No attempt is made to parse
            // or rewrite a leading WebTransport quarter-stream-id.
            if let Err(e) = qconn.dgram_send(&self.buf[..len]) {
                if !matches!(e, quiche::Error::Done) {
                    tracing::warn!(error = %e, "failed to echo datagram");
                }
            }
        }
    }
}

impl ApplicationOverQuic for Driver {
    fn on_conn_established(
        &mut self,
        qconn: &mut QuicheConnection,
        _handshake_info: &HandshakeInfo,
    ) -> QuicResult<()> {
        let alpn = qconn.application_proto();
        tracing::info!(alpn = %String::from_utf8_lossy(alpn), "connection established");

        if alpn == ALPN_H3 {
            let mut engine = h3::Engine::new();
            let peer_uni = qconn.peer_streams_left_uni();
            match engine.setup(&mut || self.next_uni.increment(), peer_uni) {
                Some(setup) => {
                    for (id, bytes) in [setup.control, setup.qpack_encoder, setup.qpack_decoder] {
                        if let Err(e) = qconn.stream_send(id.into(), &bytes, false) {
                            tracing::warn!(?id, error = %e, "failed to open h3 setup stream");
                        }
                    }
                    self.mode = Mode::Http3(engine);
                }
                None => {
                    self.fail(ConnError::H3SetupCreditExhausted);
                }
            }
        } else if alpn == ALPN_ECHO {
            self.mode = Mode::RawEcho;
        } else {
            tracing::warn!(alpn = %String::from_utf8_lossy(alpn), "unexpected negotiated protocol");
            self.fail(ConnError::Transport("unsupported ALPN negotiated".into()));
        }

        Ok(())
    }

    fn should_act(&self) -> bool {
        self.closed.is_none()
    }

    fn buffer(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    async fn wait_for_data(&mut self, _qconn: &mut QuicheConnection) -> Result<(), BoxError> {
        // All of this driver's work happens synchronously inside
        // `process_reads`/`process_writes`; there's nothing to await beyond
        // what the runtime already waits for (socket readiness, timers).
        Ok(())
    }

    fn process_reads(&mut self, qconn: &mut QuicheConnection) -> QuicResult<()> {
        while let Some(raw_id) = qconn.stream_readable_next() {
            let stream_id = StreamId::from(raw_id);
            if let Err(e) = self.read_stream(qconn, stream_id) {
                self.fail(ConnError::Transport(e.to_string()));
                break;
            }
        }

        if let Err(e) = self.read_datagrams(qconn) {
            self.fail(ConnError::Transport(e.to_string()));
        }

        Ok(())
    }

    fn process_writes(&mut self, qconn: &mut QuicheConnection) -> QuicResult<()> {
        if let Err(e) = scheduler::drive_writes(qconn, &mut self.registry) {
            self.fail(ConnError::Transport(e.to_string()));
            return Ok(());
        }

        if let Some(err) = &self.closed {
            let code = err.app_error_code();
            tracing::info!(error = %err, code = code.0, "closing connection");
            let _ = qconn.close(true, code.0, err.to_string().as_bytes());
        }

        Ok(())
    }

    fn on_conn_close<M: Metrics>(
        &mut self,
        qconn: &mut QuicheConnection,
        _metrics: &M,
        connection_result: &QuicResult<()>,
    ) {
        let reason = if let Some(local) = qconn.local_error() {
            format!(
                "local close: code={} reason={}",
                local.error_code,
                String::from_utf8_lossy(&local.reason)
            )
        } else if let Some(peer) = qconn.peer_error() {
            format!(
                "peer close: code={} reason={}",
                peer.error_code,
                String::from_utf8_lossy(&peer.reason)
            )
        } else if let Err(e) = connection_result {
            format!("runtime error: {e}")
        } else {
            "clean close".to_string()
        };

        tracing::info!(reason = %reason, "connection closed");

        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_driver() -> Driver {
        let (tx, _rx) = tokio::sync::oneshot::channel();
        Driver::new(tx)
    }

    #[test]
    fn new_driver_starts_unestablished_with_no_streams() {
        let driver = new_driver();
        assert!(matches!(driver.mode, Mode::Unestablished));
        assert!(driver.registry.is_empty());
        assert!(driver.should_act());
    }

    #[test]
    fn dispatch_before_established_does_not_panic() {
        let mut driver = new_driver();
        driver.dispatch(StreamId::from_raw(0), b"hello", false);
        assert!(driver.registry.is_empty());
    }

    #[test]
    fn raw_echo_mode_buffers_bytes_and_marks_fin() {
        let mut driver = new_driver();
        driver.mode = Mode::RawEcho;
        let id = StreamId::from_raw(0);
        driver.dispatch(id, b"ping", true);

        let stream = driver.registry.get(id).unwrap();
        assert_eq!(stream.pending(), b"ping");
        assert!(stream.fin_received);
        assert!(stream.local_fin);
    }
}
