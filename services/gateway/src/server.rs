use crate::config::GatewayConfig;
use crate::proxy::GatewayHandler;
use anyhow::{Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

pub struct GatewayServer {
    config: Arc<GatewayConfig>,
    handler: Arc<GatewayHandler>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let tls_acceptor = if config.enable_tls {
            Some(Self::create_tls_acceptor(&config)?)
        } else {
            None
        };

        let config = Arc::new(config);
        let handler = Arc::new(GatewayHandler::new((*config).clone())?);

        Ok(Self {
            config,
            handler,
            tls_acceptor,
        })
    }

    pub fn handler(&self) -> Arc<GatewayHandler> {
        Arc::clone(&self.handler)
    }

    /// Server-side TLS with the configured certificate chain and key.
    fn create_tls_acceptor(config: &GatewayConfig) -> Result<TlsAcceptor> {
        use rustls::pki_types::CertificateDer;
        use std::fs::File;
        use std::io::BufReader;

        let cert_path = config
            .tls_cert_path
            .as_ref()
            .context("TLS_CERT_PATH not set")?;
        let cert_file = File::open(cert_path)
            .with_context(|| format!("Failed to open certificate file: {:?}", cert_path))?;
        let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse certificate")?;

        let key_path = config.tls_key_path.as_ref().context("TLS_KEY_PATH not set")?;
        let key_file = File::open(key_path)
            .with_context(|| format!("Failed to open key file: {:?}", key_path))?;
        let private_key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .context("Failed to parse private key")?
            .context("No private key found in file")?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls_config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .context("Failed to select TLS protocol versions")?
            .with_no_client_auth()
            .with_single_cert(certs, private_key)
            .context("Failed to build TLS config")?;

        Ok(TlsAcceptor::from(Arc::new(tls_config)))
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .listen_addr()
            .parse()
            .context("Invalid listen address")?;

        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        self.serve(listener).await
    }

    /// Accept loop over an already bound listener; one task per connection.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(
            addr = %listener.local_addr()?,
            tls = self.tls_acceptor.is_some(),
            routes = self.config.routes.len(),
            "Gateway listening"
        );

        let server = Arc::new(self);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let server = Arc::clone(&server);

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                    debug!("Connection error from {}: {:#}", peer_addr, e);
                }
            });
        }
    }

    async fn handle_connection(
        &self,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        match &self.tls_acceptor {
            Some(tls_acceptor) => {
                let tls_stream = tls_acceptor
                    .accept(stream)
                    .await
                    .context("TLS handshake failed")?;
                self.serve_connection(tls_stream, peer_addr).await
            }
            None => self.serve_connection(stream, peer_addr).await,
        }
    }

    async fn serve_connection<S>(&self, io: S, peer_addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = Arc::clone(&self.handler);

        let service = service_fn(move |req| {
            let handler = Arc::clone(&handler);
            async move { Ok::<_, Infallible>(handler.handle(req, peer_addr).await) }
        });

        http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .await
            .context("Failed to serve connection")?;

        Ok(())
    }
}
