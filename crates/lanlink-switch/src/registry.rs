//! Online points

use chrono::{DateTime, Utc};
use lanlink_auth::Role;
use lanlink_transport::{Connection, Device};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// An authenticated point; attached to its connection as the private payload
#[derive(Debug)]
pub struct PointSession {
    pub uuid: String,
    pub alias: String,
    pub network: String,
    /// Credential key, `name@network`
    pub user: String,
    pub role: Role,
    pub system: String,
    pub connection: Arc<Connection>,
    pub device: Arc<dyn Device>,
    pub connected_at: DateTime<Utc>,
}

impl PointSession {
    /// Key of the connection this session lives on
    pub fn client(&self) -> &str {
        self.connection.id()
    }
}

/// Sessions keyed by connection id
#[derive(Default)]
pub struct PointRegistry {
    points: RwLock<HashMap<String, Arc<PointSession>>>,
}

impl PointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, session: Arc<PointSession>) {
        self.points
            .write()
            .await
            .insert(session.client().to_string(), session);
    }

    pub async fn remove(&self, client: &str) -> Option<Arc<PointSession>> {
        self.points.write().await.remove(client)
    }

    pub async fn get(&self, client: &str) -> Option<Arc<PointSession>> {
        self.points.read().await.get(client).cloned()
    }

    /// Sessions of the same device, oldest first
    pub async fn by_uuid(&self, uuid: &str) -> Vec<Arc<PointSession>> {
        self.select(|session| session.uuid == uuid).await
    }

    /// Sessions logged in with the same credential, oldest first
    pub async fn by_user(&self, user: &str) -> Vec<Arc<PointSession>> {
        self.select(|session| session.user == user).await
    }

    pub async fn list(&self) -> Vec<Arc<PointSession>> {
        self.select(|_| true).await
    }

    pub async fn len(&self) -> usize {
        self.points.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.points.read().await.is_empty()
    }

    async fn select<F>(&self, filter: F) -> Vec<Arc<PointSession>>
    where
        F: Fn(&PointSession) -> bool,
    {
        let mut sessions: Vec<Arc<PointSession>> = self
            .points
            .read()
            .await
            .values()
            .filter(|session| filter(session))
            .cloned()
            .collect();
        sessions.sort_by_key(|session| session.connected_at);
        sessions
    }
}
