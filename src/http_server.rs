use {super::*, axum_server::tls_rustls::RustlsConfig};

static RUSTLS_PROVIDER_INSTALLED: LazyLock<bool> = LazyLock::new(|| {
    rustls::crypto::ring::default_provider()
        .install_default()
        .is_ok()
});

/// Bind and serve the HTTP(S) server carrying the WebSocket acceptor and the
/// stats endpoint. A bind or TLS failure here is the one error that takes
/// the process down.
pub(crate) async fn spawn(
    settings: &Settings,
    router: Router,
    cancel_token: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<io::Result<()>>)> {
    let handle = Handle::new();

    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        cancel_token.cancelled().await;
        info!("Received shutdown signal, stopping HTTP server...");
        shutdown_handle.shutdown();
    });

    let listener =
        std::net::TcpListener::bind((settings.listen_address(), settings.listen_port()))
            .with_context(|| {
                format!(
                    "failed to bind HTTP server to {}:{}",
                    settings.listen_address(),
                    settings.listen_port()
                )
            })?;

    listener.set_nonblocking(true)?;

    let address = listener.local_addr()?;

    let task = if let Some((cert, key)) = settings.tls_files() {
        ensure! {
            *RUSTLS_PROVIDER_INSTALLED,
            "failed to install rustls ring crypto provider",
        }

        let config = RustlsConfig::from_pem_file(cert, key)
            .await
            .context("failed to load TLS certificate and key")?;

        info!("HTTPS server listening on https://{address}");

        tokio::spawn(async move {
            axum_server::from_tcp_rustls(listener, config)?
                .handle(handle)
                .serve(router.into_make_service())
                .await
        })
    } else {
        info!("HTTP server listening on http://{address}");

        tokio::spawn(async move {
            axum_server::from_tcp(listener)?
                .handle(handle)
                .serve(router.into_make_service())
                .await
        })
    };

    Ok((address, task))
}
