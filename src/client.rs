use crate::{
    connection::{Connection, ConnectionConfig},
    error::Error,
    request::Request,
    response::Response,
};
use log::trace;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{self, OwnedTrustAnchor, RootCertStore, ServerName},
    TlsConnector,
};
use url::Url;

/// Simple per-request client: each request dials its own TLS connection,
/// negotiates `h2` via ALPN, and closes gracefully after the response. For
/// multiplexing, use [`Client::connect`] and hold on to the [`Connection`].
pub struct Client {
    rustls_config: Arc<rustls::ClientConfig>,
    config: ConnectionConfig,
}

impl Client {
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        let mut root_store = RootCertStore::empty();
        root_store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        let mut rustls_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        rustls_config.alpn_protocols = vec![b"h2".to_vec()];
        Self {
            rustls_config: Arc::new(rustls_config),
            config,
        }
    }

    /// Dials `url`'s authority and runs the connection handshake.
    pub async fn connect(&self, url: &Url) -> Result<Connection, Error> {
        if url.scheme() != "https" {
            return Err(Error::InvalidRequest("only https URLs are supported"));
        }
        let host = url
            .host_str()
            .ok_or(Error::InvalidRequest("no host in URL"))?;
        let port = url
            .port_or_known_default()
            .ok_or(Error::InvalidRequest("no port for URL"))?;
        let tcp = TcpStream::connect((host, port)).await?;
        let server_name = ServerName::try_from(host)
            .map_err(|_| Error::InvalidRequest("invalid host name"))?;
        let tls = TlsConnector::from(self.rustls_config.clone())
            .connect(server_name, tcp)
            .await?;
        if tls.get_ref().1.alpn_protocol() != Some(&b"h2"[..]) {
            return Err(Error::AlpnRejected);
        }
        trace!("connected to {}:{} over h2", host, port);
        Ok(Connection::handshake(tls, self.config.clone()))
    }

    pub async fn request(&self, request: Request) -> Result<Response, Error> {
        let connection = self.connect(&request.url).await?;
        let response = connection.request(request).await?;
        connection.close(true).await;
        Ok(response)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}
