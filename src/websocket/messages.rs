//! Wire message shapes for the real-time fan-out hub (spec §4.E, §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// JSON envelope carried over a WebSocket frame: `{type, data, timestamp,
/// tenant_id?, user_id?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl FleetEnvelope {
    pub fn new(message_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            message_type: message_type.into(),
            data,
            timestamp: Utc::now(),
            tenant_id: None,
            user_id: None,
        }
    }

    pub fn tagged(
        message_type: impl Into<String>,
        data: serde_json::Value,
        tenant_id: Option<String>,
        user_id: Option<String>,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            data,
            timestamp: Utc::now(),
            tenant_id,
            user_id,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// The `type` values a client may receive, per spec §6.
pub mod message_type {
    pub const CONNECTION_ESTABLISHED: &str = "connection_established";
    pub const FLEET_DASHBOARD_UPDATE: &str = "fleet_dashboard_update";
    pub const VEHICLE_LOCATION_UPDATE: &str = "vehicle_location_update";
    pub const DRIVER_EVENT_UPDATE: &str = "driver_event_update";
    pub const GEOFENCE_VIOLATION_UPDATE: &str = "geofence_violation_update";
    pub const TRIP_UPDATE: &str = "trip_update";
    pub const MAINTENANCE_ALERT_UPDATE: &str = "maintenance_alert_update";
    pub const ALERT: &str = "alert";
    pub const ALERT_READ: &str = "alert_read";
    pub const ALERT_DELETED: &str = "alert_deleted";
}

/// Which clients a broadcast should reach.
#[derive(Debug, Clone)]
pub enum BroadcastScope {
    All,
    Tenant(String),
    User(String, String),
}

/// Serializable mirror of [`BroadcastScope`] carried over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum BridgeScope {
    All,
    Tenant { tenant_id: String },
    User { tenant_id: String, user_id: String },
}

impl From<&BroadcastScope> for BridgeScope {
    fn from(scope: &BroadcastScope) -> Self {
        match scope {
            BroadcastScope::All => BridgeScope::All,
            BroadcastScope::Tenant(tenant_id) => BridgeScope::Tenant { tenant_id: tenant_id.clone() },
            BroadcastScope::User(tenant_id, user_id) => {
                BridgeScope::User { tenant_id: tenant_id.clone(), user_id: user_id.clone() }
            }
        }
    }
}

/// The payload published on the cross-node pub/sub channel: a
/// [`FleetEnvelope`] tagged with the scope it was broadcast under, a unique
/// message id, and the id of the node that originated it. `origin_node` lets
/// the originator's own bridge loop recognize its own echo (it already
/// delivered locally, synchronously) without relying on the shared store;
/// `message_id` is what peer nodes dedup against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BridgeMessage {
    pub message_id: String,
    pub origin_node: String,
    pub scope: BridgeScope,
    pub envelope: FleetEnvelope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = FleetEnvelope::tagged(
            message_type::VEHICLE_LOCATION_UPDATE,
            serde_json::json!({"lat": 1.0, "lng": 2.0}),
            Some("tenant-1".into()),
            Some("user-1".into()),
        );
        let json = envelope.to_json().unwrap();
        assert!(json.contains("\"type\":\"vehicle_location_update\""));
        let back: FleetEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message_type, envelope.message_type);
        assert_eq!(back.tenant_id, envelope.tenant_id);
    }

    #[test]
    fn envelope_omits_absent_scope_fields() {
        let envelope = FleetEnvelope::new(message_type::ALERT, serde_json::json!({"msg": "hi"}));
        let json = envelope.to_json().unwrap();
        assert!(!json.contains("tenant_id"));
        assert!(!json.contains("user_id"));
    }

    #[test]
    fn bridge_scope_mirrors_broadcast_scope() {
        let scope = BroadcastScope::User("tenant-1".into(), "user-1".into());
        let bridge_scope: BridgeScope = (&scope).into();
        match bridge_scope {
            BridgeScope::User { tenant_id, user_id } => {
                assert_eq!(tenant_id, "tenant-1");
                assert_eq!(user_id, "user-1");
            }
            _ => panic!("expected user scope"),
        }
    }
}
