//! The IMAP session as a singly held resource.
//!
//! [`SessionManager::acquire`] never waits: when another operation holds the
//! session it fails with [`SyncError::ServiceUnavailable`] and queuing is left
//! to the scheduler.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use super::connection::{BoxedStream, ImapConnection};
use crate::error::{Result, SyncError};

/// Opens the raw byte stream to the server.
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, io::Result<BoxedStream>>;
}

/// TCP, optionally wrapped in TLS verified against the webpki roots.
#[derive(Debug, Clone)]
pub struct TcpTlsConnector {
    host: String,
    port: u16,
    tls: bool,
}

impl TcpTlsConnector {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    fn tls_connector() -> io::Result<TlsConnector> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| io::Error::other(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(TlsConnector::from(Arc::new(config)))
    }
}

impl Connector for TcpTlsConnector {
    fn connect(&self) -> BoxFuture<'_, io::Result<BoxedStream>> {
        Box::pin(async move {
            let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
            tcp.set_nodelay(true)?;

            if !self.tls {
                warn!("Connecting to {} without TLS", self.host);
                return Ok(Box::new(tcp) as BoxedStream);
            }

            let name = ServerName::try_from(self.host.clone())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let stream = Self::tls_connector()?.connect(name, tcp).await?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

/// Owns the one cached connection; connects lazily on first acquisition.
pub struct SessionManager {
    connector: Arc<dyn Connector>,
    credentials: Credentials,
    timeout: Duration,
    slot: Arc<Mutex<Option<ImapConnection>>>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn Connector>, credentials: Credentials, timeout: Duration) -> Self {
        Self {
            connector,
            credentials,
            timeout,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Take exclusive hold of the session, connecting if needed.
    pub async fn acquire(&self) -> Result<SessionGuard> {
        let guard = Arc::clone(&self.slot)
            .try_lock_owned()
            .map_err(|_| SyncError::ServiceUnavailable)?;

        let mut session = SessionGuard { guard };
        if session.guard.is_none() {
            let connection = self.connect().await?;
            *session.guard = Some(connection);
        }
        Ok(session)
    }

    async fn connect(&self) -> Result<ImapConnection> {
        let stream = tokio::time::timeout(self.timeout, self.connector.connect())
            .await
            .map_err(|_| {
                SyncError::Network(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
            })??;

        let mut connection = ImapConnection::open(stream, self.timeout).await?;
        connection.capability().await?;
        connection
            .login(&self.credentials.username, &self.credentials.password)
            .await?;
        // Servers may advertise more after authentication.
        connection.capability().await?;

        info!("IMAP session established for {}", self.credentials.username);
        Ok(connection)
    }

    /// Log out and drop the cached connection. Waits for the current holder.
    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(mut connection) = slot.take()
            && let Err(e) = connection.logout().await
        {
            debug!("LOGOUT failed: {}", e);
        }
    }
}

/// Exclusive hold on the session; released on drop.
pub struct SessionGuard {
    guard: OwnedMutexGuard<Option<ImapConnection>>,
}

impl SessionGuard {
    pub fn connection(&mut self) -> Result<&mut ImapConnection> {
        self.guard.as_mut().ok_or_else(|| {
            SyncError::Network(io::Error::new(
                io::ErrorKind::NotConnected,
                "IMAP session was invalidated",
            ))
        })
    }

    /// Drop the connection so the next acquisition reconnects.
    pub fn invalidate(&mut self) {
        if self.guard.take().is_some() {
            debug!("IMAP connection dropped");
        }
    }
}
