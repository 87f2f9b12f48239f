//! Access gate: nothing but a login gets through before authentication

use crate::registry::{PointRegistry, PointSession};
use crate::{OfflineSender, SwitchResult};
use chrono::Utc;
use lanlink_auth::{AuthError, AuthResult, CredentialStore, Identity, Role};
use lanlink_proto::control::LOGIN_OKAY;
use lanlink_proto::{Action, ControlMessage, Frame, LoginRequest, SignInMessage};
use lanlink_transport::{Connection, Device, DeviceFactory, Status};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Login counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessStats {
    pub success: u64,
    pub failed: u64,
}

pub struct Access {
    credentials: Arc<CredentialStore>,
    points: Arc<PointRegistry>,
    devices: Arc<dyn DeviceFactory>,
    offline: OfflineSender,
    switch_name: String,
    success: AtomicU64,
    failed: AtomicU64,
}

impl Access {
    pub fn new(
        credentials: Arc<CredentialStore>,
        points: Arc<PointRegistry>,
        devices: Arc<dyn DeviceFactory>,
        offline: OfflineSender,
        switch_name: impl Into<String>,
    ) -> Self {
        Self {
            credentials,
            points,
            devices,
            offline,
            switch_name: switch_name.into(),
            success: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> AccessStats {
        AccessStats {
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Handle a login request, answering `okay` or the failure reason.
    ///
    /// On success the connection is authenticated, carries its
    /// [`PointSession`] and owns a freshly opened device. Older sessions of
    /// the same device, and of the same guest credential, are queued for
    /// teardown.
    pub async fn login(
        &self,
        conn: &Arc<Connection>,
        message: &ControlMessage,
    ) -> SwitchResult<Arc<PointSession>> {
        if let Some(session) = self.current_session(conn) {
            debug!(user = %session.user, "Login repeated on an authenticated connection");
            self.respond(conn, LOGIN_OKAY).await;
            return Ok(session);
        }

        match self.authenticate(conn, message).await {
            Ok(session) => {
                self.success.fetch_add(1, Ordering::Relaxed);
                self.respond(conn, LOGIN_OKAY).await;
                Ok(session)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(connection = %conn.remote_address(), "Login failed: {}", e);
                self.respond(conn, &e.to_string()).await;
                let _ = conn.set_status(Status::UnAuthenticated);
                Err(e)
            }
        }
    }

    /// Session of an authenticated connection.
    ///
    /// Fails with [`AuthError::NotAuthenticated`] otherwise; a ping from an
    /// unauthenticated point is answered with a sign-in prompt.
    pub async fn admit(
        &self,
        conn: &Arc<Connection>,
        message: &ControlMessage,
    ) -> AuthResult<Arc<PointSession>> {
        if let Some(session) = self.current_session(conn) {
            return Ok(session);
        }
        if message.action == Action::Ping {
            self.prompt_sign_in(conn).await;
        }
        Err(AuthError::NotAuthenticated)
    }

    fn current_session(&self, conn: &Connection) -> Option<Arc<PointSession>> {
        if !conn.is_authenticated() {
            return None;
        }
        conn.private::<PointSession>()
    }

    async fn authenticate(
        &self,
        conn: &Arc<Connection>,
        message: &ControlMessage,
    ) -> SwitchResult<Arc<PointSession>> {
        let login: LoginRequest = message
            .parse_json()
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        let identity = Identity::from_login(&login);
        let credential = self.credentials.authenticate(&identity).await?;

        self.evict(conn, &identity, credential.role).await;

        let device = self.devices.open().await?;
        conn.set_status(Status::Authenticated)?;

        let session = Arc::new(PointSession {
            uuid: identity.uuid.clone(),
            alias: identity.alias.clone(),
            network: identity.network.clone(),
            user: credential.id(),
            role: credential.role,
            system: identity.system.clone(),
            connection: conn.clone(),
            device: device.clone(),
            connected_at: Utc::now(),
        });
        conn.set_private(session.clone());
        self.points.add(session.clone()).await;
        spawn_device_reader(device, conn.clone());

        info!(
            user = %session.user,
            alias = %session.alias,
            uuid = %session.uuid,
            connection = %conn.remote_address(),
            "Point online"
        );
        Ok(session)
    }

    /// Queue older sessions for teardown: same device always, same
    /// credential when it is a guest
    async fn evict(&self, conn: &Connection, identity: &Identity, role: Role) {
        let mut stale = self.points.by_uuid(&identity.uuid).await;
        if role == Role::Guest {
            stale.extend(self.points.by_user(&identity.id()).await);
        }

        let mut queued = Vec::new();
        for session in stale {
            if session.client() == conn.id() || queued.contains(&session.client().to_string()) {
                continue;
            }
            info!(
                user = %session.user,
                uuid = %session.uuid,
                connection = %session.connection.remote_address(),
                "Forcing older session offline"
            );
            queued.push(session.client().to_string());
            let _ = self.offline.send(session.connection.clone());
        }
    }

    async fn prompt_sign_in(&self, conn: &Connection) {
        let prompt = SignInMessage {
            address: conn.local_address(),
            switch: self.switch_name.clone(),
        };
        match ControlMessage::request_json(Action::SignIn, &prompt) {
            Ok(message) => {
                if let Err(e) = conn.write_message(message.into_frame()).await {
                    debug!("Sign-in prompt not sent: {}", e);
                }
            }
            Err(e) => warn!("Cannot encode sign-in prompt: {}", e),
        }
    }

    async fn respond(&self, conn: &Connection, body: &str) {
        let response = ControlMessage::response(Action::Login, body.to_string());
        if let Err(e) = conn.write_message(response.into_frame()).await {
            debug!(connection = %conn.remote_address(), "Login response not sent: {}", e);
        }
    }
}

/// Frames the host writes to a session's device go to its point
fn spawn_device_reader(device: Arc<dyn Device>, conn: Arc<Connection>) {
    tokio::spawn(async move {
        loop {
            let frame = match device.read().await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(device = %device.name(), "Device reader finished: {}", e);
                    return;
                }
            };
            if let Err(e) = conn.write_message(Frame::new(frame)).await {
                debug!(connection = %conn.remote_address(), "Point unreachable: {}", e);
                return;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanlink_auth::Credential;
    use lanlink_proto::FrameCodec;
    use lanlink_transport::{Acceptor, Connector, DeviceMode, MemoryConnector, VirtualDeviceFactory};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        access: Access,
        points: Arc<PointRegistry>,
        offline: mpsc::UnboundedReceiver<Arc<Connection>>,
        connector: Arc<dyn Connector>,
        acceptor: lanlink_transport::MemoryAcceptor,
    }

    async fn fixture() -> Fixture {
        let credentials = CredentialStore::new();
        credentials
            .add(Credential::new("hi", "default", "secret", Role::Member))
            .await;
        credentials
            .add(Credential::new("visitor", "default", "guest", Role::Guest))
            .await;
        let points = Arc::new(PointRegistry::new());
        let (devices, _handles) = VirtualDeviceFactory::new("sw", 1500, DeviceMode::Tap);
        let (tx, offline) = mpsc::unbounded_channel();
        let access = Access::new(Arc::new(credentials), points.clone(), Arc::new(devices), tx, "sw1");
        let (connector, acceptor) = MemoryConnector::pair("switch:10002", FrameCodec::new());

        Fixture {
            access,
            points,
            offline,
            connector: Arc::new(connector),
            acceptor,
        }
    }

    /// Point and switch ends of a fresh connection
    async fn dial(f: &Fixture) -> (Connection, Arc<Connection>) {
        let point = Connection::client(f.connector.clone(), Duration::from_secs(5));
        point.connect().await.unwrap();
        let server = Connection::accepted(f.acceptor.accept().await.unwrap(), Duration::from_secs(5));
        (point, Arc::new(server))
    }

    fn login(name: &str, password: &str, uuid: &str) -> ControlMessage {
        ControlMessage::request_json(
            Action::Login,
            &LoginRequest {
                name: name.to_string(),
                password: password.to_string(),
                uuid: uuid.to_string(),
                alias: uuid.to_string(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    async fn response(point: &Connection) -> String {
        let message = point.read_message().await.unwrap().to_control().unwrap();
        message.body_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_login_success() {
        let f = fixture().await;
        let (point, server) = dial(&f).await;

        let session = f.access.login(&server, &login("hi", "secret", "u-1")).await.unwrap();
        assert_eq!(response(&point).await, LOGIN_OKAY);
        assert_eq!(session.user, "hi@default");
        assert!(server.is_authenticated());
        assert_eq!(f.points.len().await, 1);
        assert_eq!(f.access.stats(), AccessStats { success: 1, failed: 0 });
    }

    #[tokio::test]
    async fn test_login_failure_reports_reason() {
        let f = fixture().await;
        let (point, server) = dial(&f).await;

        assert!(f.access.login(&server, &login("hi", "wrong", "u-1")).await.is_err());
        assert_eq!(response(&point).await, "Auth failed for hi@default");
        assert_eq!(server.status(), Status::UnAuthenticated);
        assert!(f.points.is_empty().await);
        assert_eq!(f.access.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_same_uuid_evicts_older_session() {
        let mut f = fixture().await;
        let (_first_point, first) = dial(&f).await;
        let (_second_point, second) = dial(&f).await;

        f.access.login(&first, &login("hi", "secret", "u-1")).await.unwrap();
        f.access.login(&second, &login("hi", "secret", "u-1")).await.unwrap();

        let evicted = f.offline.recv().await.unwrap();
        assert_eq!(evicted.id(), first.id());
        assert!(f.offline.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_guest_credential_keeps_latest_only() {
        let mut f = fixture().await;
        let (_first_point, first) = dial(&f).await;
        let (_second_point, second) = dial(&f).await;

        f.access.login(&first, &login("visitor", "guest", "u-1")).await.unwrap();
        f.access.login(&second, &login("visitor", "guest", "u-2")).await.unwrap();

        assert_eq!(f.offline.recv().await.unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn test_member_credential_shared_across_devices() {
        let mut f = fixture().await;
        let (_first_point, first) = dial(&f).await;
        let (_second_point, second) = dial(&f).await;

        f.access.login(&first, &login("hi", "secret", "u-1")).await.unwrap();
        f.access.login(&second, &login("hi", "secret", "u-2")).await.unwrap();

        assert!(f.offline.try_recv().is_err());
        assert_eq!(f.points.by_user("hi@default").await.len(), 2);
    }

    #[tokio::test]
    async fn test_unauthenticated_ping_prompts_sign_in() {
        let f = fixture().await;
        let (point, server) = dial(&f).await;

        let ping = ControlMessage::request(Action::Ping, "{}");
        let denied = f.access.admit(&server, &ping).await.unwrap_err();
        assert_eq!(denied, AuthError::NotAuthenticated);

        let prompt = point.read_message().await.unwrap().to_control().unwrap();
        assert_eq!(prompt.action, Action::SignIn);
        assert!(prompt.is_request());
        let sign_in: SignInMessage = prompt.parse_json().unwrap();
        assert_eq!(sign_in.switch, "sw1");
    }
}
