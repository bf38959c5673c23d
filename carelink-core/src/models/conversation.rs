use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{ChatError, ChatResult};

use super::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Doctor,
    Pharmacy,
    Admin,
}

impl Role {
    /// Model name the REST backend expects in `receiverModel`.
    pub fn receiver_model(&self) -> &'static str {
        match self {
            Role::Patient => "Patient",
            Role::Doctor => "Doctor",
            Role::Pharmacy => "Pharmacy",
            Role::Admin => "User",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Patient => write!(f, "patient"),
            Role::Doctor => write!(f, "doctor"),
            Role::Pharmacy => write!(f, "pharmacy"),
            Role::Admin => write!(f, "admin"),
        }
    }
}

impl FromStr for Role {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "patient" => Ok(Role::Patient),
            "doctor" => Ok(Role::Doctor),
            "pharmacy" | "pharmacist" => Ok(Role::Pharmacy),
            "admin" => Ok(Role::Admin),
            other => Err(ChatError::InvalidConfigValue {
                key: "role".to_string(),
                message: format!("Unknown role '{}'", other),
            }),
        }
    }
}

/// The signed-in user driving a chat surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: Option<String>,
    pub role: Role,
}

impl Participant {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            name: None,
            role,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Business identifiers known about the conversation being opened.
///
/// Any subset may be present; [`ConversationContext::room_key`] decides
/// which room they describe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    pub order_id: Option<String>,
    pub medical_request_id: Option<String>,
    pub request_id: Option<String>,
    pub pharmacy_id: Option<String>,
    pub patient_id: Option<String>,
    pub appointment_id: Option<String>,
    pub counterpart_id: Option<String>,
    pub counterpart_role: Option<Role>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_order(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    pub fn with_medical_request(mut self, request_id: impl Into<String>) -> Self {
        self.medical_request_id = Some(request_id.into());
        self
    }

    pub fn with_pharmacy(mut self, pharmacy_id: impl Into<String>) -> Self {
        self.pharmacy_id = Some(pharmacy_id.into());
        self
    }

    pub fn with_patient(mut self, patient_id: impl Into<String>) -> Self {
        self.patient_id = Some(patient_id.into());
        self
    }

    pub fn with_appointment(mut self, appointment_id: impl Into<String>) -> Self {
        self.appointment_id = Some(appointment_id.into());
        self
    }

    pub fn with_counterpart(mut self, counterpart_id: impl Into<String>, role: Role) -> Self {
        self.counterpart_id = Some(counterpart_id.into());
        self.counterpart_role = Some(role);
        self
    }

    /// Canonical order key: the first non-empty of the three order aliases.
    pub fn order_key(&self) -> Option<&str> {
        [&self.order_id, &self.medical_request_id, &self.request_id]
            .into_iter()
            .find_map(|id| non_empty(id))
    }

    pub fn pharmacy(&self) -> Option<&str> {
        non_empty(&self.pharmacy_id)
    }

    pub fn patient(&self) -> Option<&str> {
        non_empty(&self.patient_id)
    }

    pub fn counterpart(&self) -> Option<&str> {
        non_empty(&self.counterpart_id)
    }

    /// Resolve which room this context describes from `me`'s point of view.
    pub fn room_key(&self, me: &Participant) -> ChatResult<RoomKey> {
        if let Some(order) = self.order_key() {
            return Ok(RoomKey::Order(order.to_string()));
        }

        if let Some(counterpart) = self.counterpart() {
            return Ok(RoomKey::Direct {
                self_id: me.id.clone(),
                counterpart_id: counterpart.to_string(),
            });
        }

        match (self.pharmacy(), self.patient()) {
            (Some(pharmacy), Some(patient)) => Ok(RoomKey::PharmacyPatient {
                pharmacy_id: pharmacy.to_string(),
                patient_id: patient.to_string(),
            }),
            (None, Some(_)) => Err(ChatError::MissingIdentifier("pharmacyId".to_string())),
            _ => Err(ChatError::MissingIdentifier(
                "orderId, counterpartId or pharmacyId+patientId".to_string(),
            )),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// The logical room a chat surface is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoomKey {
    /// Order/medication-request scoped room
    Order(String),
    /// One-to-one conversation (consultations, dashboards)
    Direct {
        self_id: String,
        counterpart_id: String,
    },
    /// Pharmacy and patient talking outside a specific order
    PharmacyPatient {
        pharmacy_id: String,
        patient_id: String,
    },
}

impl RoomKey {
    /// Whether a message belongs to this room.
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            RoomKey::Order(order) => message.conversation_key.as_deref() == Some(order.as_str()),
            RoomKey::Direct {
                self_id,
                counterpart_id,
            } => {
                let receiver = message.receiver_id.as_deref();
                let from_counterpart = message.sender_id == *counterpart_id
                    && receiver.map_or(true, |r| r == self_id);
                let from_me =
                    message.sender_id == *self_id && receiver == Some(counterpart_id.as_str());
                from_counterpart || from_me
            }
            RoomKey::PharmacyPatient {
                pharmacy_id,
                patient_id,
            } => {
                if message.pharmacy_id.is_some() || message.patient_id.is_some() {
                    return message.pharmacy_id.as_deref() == Some(pharmacy_id.as_str())
                        && message.patient_id.as_deref() == Some(patient_id.as_str());
                }
                let pair = [pharmacy_id.as_str(), patient_id.as_str()];
                pair.contains(&message.sender_id.as_str())
                    && message
                        .receiver_id
                        .as_deref()
                        .map_or(false, |r| pair.contains(&r) && r != message.sender_id)
            }
        }
    }
}

impl std::fmt::Display for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomKey::Order(order) => write!(f, "order:{}", order),
            RoomKey::Direct { counterpart_id, .. } => write!(f, "direct:{}", counterpart_id),
            RoomKey::PharmacyPatient {
                pharmacy_id,
                patient_id,
            } => write!(f, "pharmacy:{}:{}", pharmacy_id, patient_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
}

impl ConnectionState {
    /// A socket is open (authenticated or not).
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Authenticated
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Authenticated => write!(f, "authenticated"),
        }
    }
}
