use anyhow::{Context, Result};
use carelink_core::{
    resolve_token, CarelinkConfig, ChatSession, ChatSessionBuilder, ConversationContext,
    DeploymentResolver, Participant, RestChatApi, Role, SessionSettings, WebSocketConnector,
};
use clap::Args;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Who is talking and which conversation they are in.
#[derive(Args, Debug, Clone)]
pub struct ConversationArgs {
    #[arg(short, long, env = "CARELINK_USER_ID", help = "Your user id")]
    pub user: String,

    #[arg(
        short,
        long,
        default_value = "patient",
        help = "Your role (patient, doctor, pharmacy, admin)"
    )]
    pub role: Role,

    #[arg(long, help = "Display name sent with your messages")]
    pub name: Option<String>,

    #[arg(short, long, help = "Order or medical request id")]
    pub order: Option<String>,

    #[arg(long, help = "Pharmacy id")]
    pub pharmacy: Option<String>,

    #[arg(long, help = "Patient id")]
    pub patient: Option<String>,

    #[arg(long, help = "Appointment id")]
    pub appointment: Option<String>,

    #[arg(short = 'w', long = "with", help = "User id of the other party")]
    pub counterpart: Option<String>,

    #[arg(long, help = "Role of the other party")]
    pub counterpart_role: Option<Role>,
}

impl ConversationArgs {
    pub fn participant(&self) -> Participant {
        let me = Participant::new(self.user.trim(), self.role);
        match &self.name {
            Some(name) => me.with_name(name.clone()),
            None => me,
        }
    }

    pub fn context(&self) -> ConversationContext {
        let mut context = ConversationContext::new();
        if let Some(order) = &self.order {
            context = context.with_medical_request(order.clone());
        }
        if let Some(pharmacy) = &self.pharmacy {
            context = context.with_pharmacy(pharmacy.clone());
        }
        if let Some(patient) = &self.patient {
            context = context.with_patient(patient.clone());
        }
        if let Some(appointment) = &self.appointment {
            context = context.with_appointment(appointment.clone());
        }
        if let Some(counterpart) = &self.counterpart {
            let role = self.counterpart_role.unwrap_or(match self.role {
                Role::Patient => Role::Doctor,
                _ => Role::Patient,
            });
            context = context.with_counterpart(counterpart.clone(), role);
        }
        context
    }
}

pub fn rest_api(config: &CarelinkConfig) -> Result<RestChatApi> {
    let token = resolve_token(&config.auth)?;
    if token.is_none() {
        tracing::warn!("No auth token configured, requests will be anonymous");
    }
    RestChatApi::from_config(config, token).context("Failed to create REST client")
}

/// Session builder wired to the configured backend. `live` adds the socket.
pub fn session_builder(
    args: &ConversationArgs,
    config: &CarelinkConfig,
    live: bool,
) -> Result<ChatSessionBuilder> {
    let api = Arc::new(rest_api(config)?);
    let mut builder = ChatSession::builder(args.participant(), args.context(), api)
        .with_settings(SessionSettings::from_config(config));

    if live {
        let mut connector = WebSocketConnector::new()
            .with_event_buffer(config.chat.event_buffer)
            .with_handshake_timeout(Duration::from_secs(config.api.request_timeout_secs));
        if let Some(token) = resolve_token(&config.auth)? {
            connector = connector.with_auth(json!({ "token": token }));
        }
        builder = builder.with_socket(
            Arc::new(connector),
            Arc::new(DeploymentResolver::from_config(&config.socket)),
        );
    }
    Ok(builder)
}
