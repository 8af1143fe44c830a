//! Platform topic templates and request-id correlation.

const ROOT: &str = "$oc/devices";

pub const MESSAGES_UP: &str = "sys/messages/up";
pub const MESSAGES_DOWN: &str = "sys/messages/down";
pub const COMMANDS: &str = "sys/commands/#";
pub const COMMAND_RESPONSE: &str = "sys/commands/response/request_id=";
pub const PROPERTIES_REPORT: &str = "sys/properties/report";
pub const PROPERTIES_SET: &str = "sys/properties/set/#";
pub const PROPERTIES_SET_RESPONSE: &str = "sys/properties/set/response/request_id=";
pub const PROPERTIES_GET: &str = "sys/properties/get/#";
pub const PROPERTIES_GET_RESPONSE: &str = "sys/properties/get/response/request_id=";
pub const SHADOW_GET: &str = "sys/shadow/get/request_id=";
pub const SHADOW_GET_RESPONSE: &str = "sys/shadow/get/response/#";
pub const EVENTS_UP: &str = "sys/events/up";
pub const EVENTS_DOWN: &str = "sys/events/down";
pub const GATEWAY_PROPERTIES_REPORT: &str = "sys/gateway/sub_devices/properties/report";
pub const BOOTSTRAP_DOWN: &str = "sys/bootstrap/down";
pub const BOOTSTRAP_UP: &str = "sys/bootstrap/up";

/// Everything a device subscribes to after connecting
pub const DEVICE_SUBSCRIPTIONS: [&str; 6] = [
    MESSAGES_DOWN,
    COMMANDS,
    PROPERTIES_SET,
    PROPERTIES_GET,
    SHADOW_GET_RESPONSE,
    EVENTS_DOWN,
];

const REQUEST_ID_MARKER: &str = "request_id=";

/// `$oc/devices/{device_id}/{suffix}`
pub fn device_topic(device_id: &str, suffix: &str) -> String {
    format!("{ROOT}/{device_id}/{suffix}")
}

/// The part after `request_id=` in an inbound topic.
pub fn request_id(topic: &str) -> Option<&str> {
    topic
        .split_once(REQUEST_ID_MARKER)
        .map(|(_, id)| id)
        .filter(|id| !id.is_empty())
}

/// Response topic for `template` correlated with the request id of `inbound`.
pub fn response_topic(device_id: &str, template: &str, inbound: &str) -> Option<String> {
    request_id(inbound).map(|id| format!("{}{id}", device_topic(device_id, template)))
}

/// MQTT filter matching for application topics.
///
/// `+` matches one level and a trailing `#` matches any remainder, including
/// none. Unlike broker-side matching, topics starting with `$` are matched
/// like any other, since every platform topic lives under `$oc/`.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    if filter == topic {
        return true;
    }
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match (part, levels.next()) {
            ("#", _) => return true,
            ("+", Some(_)) => {}
            (part, Some(level)) if part == level => {}
            _ => return false,
        }
    }
    levels.next().is_none()
}

/// Inbound topic categories in priority order. The first match wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopicCategory {
    MessageDown,
    Command,
    PropertiesSet,
    PropertiesGet,
    ShadowResponse,
    EventDown,
    Unknown,
}

impl TopicCategory {
    const PATTERNS: [(&'static str, TopicCategory); 6] = [
        ("/messages/down", TopicCategory::MessageDown),
        ("commands/request_id", TopicCategory::Command),
        ("properties/set/request_id", TopicCategory::PropertiesSet),
        ("properties/get/request_id", TopicCategory::PropertiesGet),
        ("shadow/get/response", TopicCategory::ShadowResponse),
        ("/events/down", TopicCategory::EventDown),
    ];

    pub fn classify(topic: &str) -> Self {
        Self::PATTERNS
            .iter()
            .find(|(pattern, _)| topic.contains(pattern))
            .map(|(_, category)| *category)
            .unwrap_or(TopicCategory::Unknown)
    }

    pub fn name(self) -> &'static str {
        match self {
            TopicCategory::MessageDown => "message",
            TopicCategory::Command => "command",
            TopicCategory::PropertiesSet => "properties-set",
            TopicCategory::PropertiesGet => "properties-get",
            TopicCategory::ShadowResponse => "shadow-response",
            TopicCategory::EventDown => "event",
            TopicCategory::Unknown => "unknown",
        }
    }
}
