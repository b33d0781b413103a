use std::sync::Arc;

use tokio_quiche::metrics::DefaultMetrics;
use tokio_quiche::quic::SimpleConnectionIdGenerator;
use tokio_quiche::settings::{CertificateKind, Hooks, QuicSettings, TlsCertificatePaths};
use tokio_quiche::socket::{QuicListener, SocketCapabilities};
use tracing_subscriber::EnvFilter;

use quic_echo_server::config::Args;
use quic_echo_server::error::ServerError;
use quic_echo_server::tls::{CertHook, CertifiedKey};
use quic_echo_server::Driver;

#[tokio::main]
async fn main() {
    let args = Args::parse_args();

    let filter = EnvFilter::try_new(&args.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), ServerError> {
    let certified = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => CertifiedKey::from_pem_files(cert, key)?,
        _ => CertifiedKey::builtin(),
    };
    let hook = Arc::new(CertHook::new(certified));

    let std_socket = std::net::UdpSocket::bind(args.bind).map_err(ServerError::Bind)?;
    std_socket.set_nonblocking(true).map_err(ServerError::Bind)?;
    let local_addr = std_socket.local_addr().map_err(ServerError::Bind)?;
    let socket = tokio::net::UdpSocket::from_std(std_socket).map_err(ServerError::Bind)?;

    #[cfg(target_os = "linux")]
    let capabilities = SocketCapabilities::apply_all_and_get_compatibility(&socket);
    #[cfg(not(target_os = "linux"))]
    let capabilities = SocketCapabilities::default();

    let listener = QuicListener {
        socket,
        socket_cookie: 0,
        capabilities,
    };

    tracing::info!(addr = %local_addr, "listening");

    // Transport parameters advertised to the peer, per the documented
    // external interface: generous per-stream/connection flow-control
    // windows sized for header-only HTTP/3 responses plus echoed bytes,
    // a modest bidi-stream count (this server only ever drives one
    // connection at a time, so there's no concurrency pressure), and a
    // handful of unidirectional streams for the HTTP/3 control + QPACK
    // pair with headroom to spare.
    let mut settings = QuicSettings::default();
    settings.max_idle_timeout = Some(std::time::Duration::from_secs(args.idle_timeout_secs));
    settings.initial_max_data = 1_048_576;
    settings.initial_max_stream_data_bidi_local = 262_144;
    settings.initial_max_stream_data_bidi_remote = 262_144;
    settings.initial_max_stream_data_uni = 262_144;
    settings.initial_max_streams_bidi = 100;
    settings.initial_max_streams_uni = 10;

    // `ConnectionHook` is only consulted when a TLS path is configured, so
    // this path is a placeholder -- the real cert/key material is served by
    // `CertHook::create_custom_ssl_context_builder`.
    let dummy_tls = TlsCertificatePaths {
        cert: "",
        private_key: "",
        kind: CertificateKind::X509,
    };
    let hooks = Hooks {
        connection_hook: Some(hook),
    };

    let params = tokio_quiche::ConnectionParams::new_server(settings, dummy_tls, hooks);

    let mut sockets = tokio_quiche::listen_with_capabilities(
        vec![listener],
        params,
        SimpleConnectionIdGenerator,
        DefaultMetrics,
    )
    .map_err(ServerError::Bind)?;

    let mut rx = sockets.remove(0).into_inner();

    // One connection is driven to completion before the next is accepted --
    // this server never multiplexes concurrent connections.
    while let Some(initial) = rx.recv().await {
        let mut initial = match initial {
            Ok(initial) => initial,
            Err(e) => {
                tracing::warn!(error = %e, "failed to accept incoming packet");
                continue;
            }
        };

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let _connection = initial.start(Driver::new(done_tx));

        if done_rx.await.is_err() {
            tracing::debug!("connection driver dropped without signaling completion");
        }
    }

    Ok(())
}
