//! Hub event record.
//!
//! Events are produced by the central hub and forwarded verbatim to
//! listeners. The relay never mutates an event; routing metadata is
//! carried through without interpretation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Key of the telemetry event carrying the live listener count.
pub const WEBSOCKET_COUNT_KEY: &str = "websocket-count";

/// Tag marking an event as a detail-state update.
pub const DETAIL_STATE_TAG: &str = "detail-state";

/// Building and room an event refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicRoomInfo {
    #[serde(rename = "buildingID", default, skip_serializing_if = "String::is_empty")]
    pub building_id: String,

    #[serde(rename = "roomID", default, skip_serializing_if = "String::is_empty")]
    pub room_id: String,
}

impl BasicRoomInfo {
    /// Derives room info from a room id of the form `BUILDING-ROOM`.
    ///
    /// The building is the first `-` separated segment; an id without a
    /// separator yields empty info.
    pub fn from_room_id(room_id: &str) -> Self {
        match room_id.split_once('-') {
            Some((building, _)) if !building.is_empty() => Self {
                building_id: building.to_string(),
                room_id: room_id.to_string(),
            },
            _ => Self::default(),
        }
    }
}

/// Device an event refers to, with the room it lives in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicDeviceInfo {
    #[serde(flatten)]
    pub room: BasicRoomInfo,

    #[serde(rename = "deviceID", default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,
}

impl BasicDeviceInfo {
    /// Derives device info from a device id of the form `BUILDING-ROOM-DEVICE`.
    ///
    /// Ids that do not have exactly three segments yield empty info.
    pub fn from_device_id(device_id: &str) -> Self {
        let parts: Vec<&str> = device_id.split('-').collect();
        match parts.as_slice() {
            [building, room, device]
                if !building.is_empty() && !room.is_empty() && !device.is_empty() =>
            {
                Self {
                    room: BasicRoomInfo {
                        building_id: (*building).to_string(),
                        room_id: format!("{building}-{room}"),
                    },
                    device_id: device_id.to_string(),
                }
            }
            _ => Self::default(),
        }
    }
}

/// A single event as published on the hub.
///
/// Every field defaults when missing so that partially populated events
/// from the hub can still be forwarded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Event {
    /// System that produced the event
    pub generating_system: String,

    /// When the event was produced
    pub timestamp: DateTime<Utc>,

    /// Free-form classification tags
    pub event_tags: Vec<String>,

    /// Device the event is about
    pub target_device: BasicDeviceInfo,

    /// Room the event is about
    pub affected_room: BasicRoomInfo,

    /// Discriminating key used for filtering
    pub key: String,

    /// Event value
    pub value: String,

    /// User associated with the event, if any
    pub user: String,

    /// Opaque structured payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    /// Creates an event with the given key and value, timestamped now.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            key: key.into(),
            value: value.into(),
            ..Self::default()
        }
    }

    /// Sets the target device, returning the updated event.
    #[must_use]
    pub fn with_target_device(mut self, device: BasicDeviceInfo) -> Self {
        self.target_device = device;
        self
    }

    /// Sets the affected room, returning the updated event.
    #[must_use]
    pub fn with_affected_room(mut self, room: BasicRoomInfo) -> Self {
        self.affected_room = room;
        self
    }

    /// Adds a tag, returning the updated event.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.event_tags.push(tag.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_info_from_device_id() {
        let info = BasicDeviceInfo::from_device_id("ITB-1101-CP1");
        assert_eq!(info.device_id, "ITB-1101-CP1");
        assert_eq!(info.room.room_id, "ITB-1101");
        assert_eq!(info.room.building_id, "ITB");
    }

    #[test]
    fn test_device_info_rejects_malformed_id() {
        assert_eq!(BasicDeviceInfo::from_device_id("ITB-1101"), BasicDeviceInfo::default());
        assert_eq!(BasicDeviceInfo::from_device_id("A-B-C-D"), BasicDeviceInfo::default());
        assert_eq!(BasicDeviceInfo::from_device_id("ITB--CP1"), BasicDeviceInfo::default());
    }

    #[test]
    fn test_room_info_from_room_id() {
        let info = BasicRoomInfo::from_room_id("ITB-1101");
        assert_eq!(info.building_id, "ITB");
        assert_eq!(info.room_id, "ITB-1101");

        assert_eq!(BasicRoomInfo::from_room_id("ITB"), BasicRoomInfo::default());
    }

    #[test]
    fn test_event_wire_field_names() {
        let event = Event::new("login", "userX")
            .with_target_device(BasicDeviceInfo::from_device_id("ITB-1101-CP1"))
            .with_tag(DETAIL_STATE_TAG);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["key"], "login");
        assert_eq!(json["value"], "userX");
        assert_eq!(json["event-tags"][0], "detail-state");
        assert_eq!(json["target-device"]["deviceID"], "ITB-1101-CP1");
        assert_eq!(json["target-device"]["roomID"], "ITB-1101");
        assert_eq!(json["target-device"]["buildingID"], "ITB");
        assert!(json.get("generating-system").is_some());
        assert!(json.get("timestamp").is_some());
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_empty_routing_fields_omitted() {
        let json = serde_json::to_value(Event::new("login", "x")).unwrap();
        assert_eq!(json["affected-room"], serde_json::json!({}));
    }

    #[test]
    fn test_partial_event_decodes_with_defaults() {
        let event: Event = serde_json::from_str(r#"{"key":"card-read-error"}"#).unwrap();
        assert_eq!(event.key, "card-read-error");
        assert!(event.value.is_empty());
        assert!(event.event_tags.is_empty());
        assert!(event.data.is_none());
    }
}
