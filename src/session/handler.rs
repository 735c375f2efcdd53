use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};

use super::messages::{CalibrationView, CloseReason, ErrorKind, Inbound, Outbound, StatusView};
use super::role::{Role, RoleLookup, UserProvisioner};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

pub const RESTART_SIMULATION: Duration = Duration::from_secs(2);

/// One accepted client. The role is resolved once at accept time and kept
/// for the lifetime of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSession {
    pub id: Uuid,
    pub identity: String,
    pub role: Role,
}

/// Replies produced after the command that triggered them has returned.
pub type ReplySender = mpsc::Sender<Outbound>;

/// Everything a session needs besides its transport.
#[derive(Clone)]
pub struct SessionContext {
    pub engine: Engine,
    pub roles: Arc<dyn RoleLookup>,
    pub users: Arc<dyn UserProvisioner>,
}

impl SessionContext {
    pub fn new(engine: Engine, roles: Arc<dyn RoleLookup>, users: Arc<dyn UserProvisioner>) -> Self {
        Self {
            engine,
            roles,
            users,
        }
    }

    /// Resolves the caller's role. A missing identity is rejected outright;
    /// an identity with no role assigned becomes an operator.
    pub async fn accept(&self, identity: Option<&str>) -> Result<ClientSession, CloseReason> {
        let identity = match identity.map(str::trim).filter(|id| !id.is_empty()) {
            Some(identity) => identity,
            None => {
                log_warn!("Rejected unauthenticated client connection");
                return Err(CloseReason::Unauthenticated);
            }
        };

        let role = match self.roles.lookup_role(identity).await {
            Ok(Some(role)) => role,
            Ok(None) => {
                log_warn!("No role assigned to {identity}, defaulting to operator");
                Role::Operator
            }
            Err(err) => {
                log_error!("Role lookup failed for {identity}: {err:#}");
                return Err(CloseReason::InternalError);
            }
        };

        let session = ClientSession {
            id: Uuid::new_v4(),
            identity: identity.to_string(),
            role,
        };
        log_info!(
            "Client session {} established for {} with role {}",
            session.id,
            session.identity,
            session.role
        );
        Ok(session)
    }

    pub fn established(&self, session: &ClientSession) -> Outbound {
        Outbound::ConnectionEstablished {
            user: session.identity.clone(),
            role: session.role,
            session_id: session.id,
        }
    }

    /// Handles one inbound frame and returns the immediate reply. Failures
    /// only ever produce an error reply; the session stays open.
    pub async fn dispatch(&self, session: &ClientSession, text: &str, replies: &ReplySender) -> Outbound {
        let inbound = match Inbound::parse(text) {
            Ok(inbound) => inbound,
            Err(err) => {
                log_warn!("Malformed frame from {}: {}", session.identity, err.message());
                return Outbound::error(ErrorKind::Malformed, err.message());
            }
        };
        log_debug!("Received action '{}' from {}", inbound.action, session.identity);

        match self.route(session, inbound, replies).await {
            Ok(reply) => reply,
            Err(EngineError::PermissionDenied(message)) => {
                log_warn!(
                    "Permission denied for {} with role {}: {message}",
                    session.identity,
                    session.role
                );
                Outbound::error(ErrorKind::PermissionDenied, message)
            }
            Err(EngineError::Validation(message)) => Outbound::error(ErrorKind::Validation, message),
            Err(err) => {
                log_error!("Error processing command from {}: {err}", session.identity);
                Outbound::error(ErrorKind::Internal, "Internal server error")
            }
        }
    }

    async fn route(
        &self,
        session: &ClientSession,
        inbound: Inbound,
        replies: &ReplySender,
    ) -> EngineResult<Outbound> {
        match inbound.action.as_str() {
            "get_status" => Ok(self.status(session.role)),
            "calibrate" => {
                require(
                    session.role,
                    Role::Calibrator,
                    "Permission denied. Calibration requires Calibrator or Admin role.",
                )?;
                self.calibrate(inbound.parameters)
            }
            "admin_action" => {
                require(
                    session.role,
                    Role::Admin,
                    "Permission denied. This action requires Admin role.",
                )?;
                let command = inbound.command.unwrap_or_default();
                self.admin_action(&command, inbound.parameters, replies).await
            }
            other => {
                log_warn!("Unknown action received: {other}");
                Ok(Outbound::error(
                    ErrorKind::UnknownAction,
                    format!("Unknown action: {other}"),
                ))
            }
        }
    }

    pub fn status(&self, role: Role) -> Outbound {
        let settings = &self.engine.settings;
        Outbound::Status(StatusView::for_role(
            &self.engine.link.snapshot(),
            &settings.connection(),
            &settings.calibration(),
            role,
            Utc::now(),
        ))
    }

    fn calibrate(&self, parameters: Option<Value>) -> EngineResult<Outbound> {
        let parameters = parameters.unwrap_or_else(|| Value::Object(Map::new()));
        let supplied = key_count(&parameters);
        let outcome = self.engine.settings.update_calibration(&parameters)?;

        if supplied > 0 && outcome.rejected.len() == supplied {
            return Ok(nothing_applied(&outcome.rejected));
        }

        let settings = serde_json::to_value(CalibrationView::from(&outcome.settings))
            .map_err(|err| EngineError::Internal(err.to_string()))?;
        Ok(Outbound::Response {
            action: "calibrate".into(),
            success: true,
            message: "Calibration settings updated successfully".into(),
            settings: Some(settings),
            rejected: outcome.rejected,
        })
    }

    async fn admin_action(
        &self,
        command: &str,
        parameters: Option<Value>,
        replies: &ReplySender,
    ) -> EngineResult<Outbound> {
        match command {
            "update_settings" => self.update_settings(parameters),
            "restart_service" => Ok(self.restart_service(replies)),
            "add_user" => self.add_user(parameters).await,
            "reconnect" => {
                self.engine.request_reconnect();
                Ok(Outbound::ack("reconnect", "Reconnect requested"))
            }
            other => Ok(Outbound::error(
                ErrorKind::UnknownAction,
                format!("Unknown admin command: {other}"),
            )),
        }
    }

    fn update_settings(&self, parameters: Option<Value>) -> EngineResult<Outbound> {
        let parameters = parameters.unwrap_or_else(|| Value::Object(Map::new()));
        let supplied = key_count(&parameters);
        let outcome = self.engine.settings.update_connection(&parameters)?;

        if supplied > 0 && outcome.rejected.len() == supplied {
            return Ok(nothing_applied(&outcome.rejected));
        }

        let settings = serde_json::to_value(&outcome.settings)
            .map_err(|err| EngineError::Internal(err.to_string()))?;
        Ok(Outbound::Response {
            action: "update_settings".into(),
            success: true,
            message: "Connection settings updated successfully".into(),
            settings: Some(settings),
            rejected: outcome.rejected,
        })
    }

    /// Acknowledges now and again after [`RESTART_SIMULATION`]; the wait runs
    /// on its own task so the session keeps streaming and answering.
    fn restart_service(&self, replies: &ReplySender) -> Outbound {
        let replies = replies.clone();
        tokio::spawn(async move {
            time::sleep(RESTART_SIMULATION).await;
            let done = Outbound::ack("restart_service", "Service restarted successfully.");
            if replies.send(done).await.is_err() {
                log_debug!("Session closed before restart acknowledgement");
            }
        });
        Outbound::ack(
            "restart_service",
            "Service restart initiated. This may take a few moments.",
        )
    }

    async fn add_user(&self, parameters: Option<Value>) -> EngineResult<Outbound> {
        let parameters = parameters.unwrap_or(Value::Null);
        let field = |name: &str| parameters.get(name).and_then(Value::as_str);

        let username = field("username")
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| EngineError::Validation("username is required".into()))?;
        let password = field("password")
            .filter(|password| !password.is_empty())
            .ok_or_else(|| EngineError::Validation("password is required".into()))?;
        let role = match field("role") {
            Some(role) => role
                .parse::<Role>()
                .map_err(|err| EngineError::Validation(err.to_string()))?,
            None => Role::Operator,
        };

        match self.users.provision_user(username, password, role).await {
            Ok(()) => Ok(Outbound::ack(
                "add_user",
                format!("User {username} created successfully with role {role}"),
            )),
            Err(err) => {
                log_warn!("Could not create user {username}: {err:#}");
                Ok(Outbound::failure("add_user", err.to_string()))
            }
        }
    }
}

fn require(role: Role, needed: Role, message: &str) -> EngineResult<()> {
    if role >= needed {
        Ok(())
    } else {
        Err(EngineError::PermissionDenied(message.to_string()))
    }
}

fn key_count(parameters: &Value) -> usize {
    parameters.as_object().map_or(0, Map::len)
}

fn nothing_applied(rejected: &[crate::settings::RejectedKey]) -> Outbound {
    let keys: Vec<&str> = rejected.iter().map(|r| r.key.as_str()).collect();
    Outbound::error(
        ErrorKind::Rejected,
        format!("No settings applied; rejected keys: {}", keys.join(", ")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::role::UserDirectory;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::json;

    struct BrokenLookup;

    #[async_trait]
    impl RoleLookup for BrokenLookup {
        async fn lookup_role(&self, _identity: &str) -> anyhow::Result<Option<Role>> {
            Err(anyhow!("directory unavailable"))
        }
    }

    fn context() -> SessionContext {
        let directory = Arc::new(UserDirectory::with_users([
            ("olga".to_string(), Role::Operator),
            ("carl".to_string(), Role::Calibrator),
            ("ada".to_string(), Role::Admin),
        ]));
        SessionContext::new(Engine::default(), directory.clone(), directory)
    }

    async fn session_for(ctx: &SessionContext, identity: &str) -> ClientSession {
        ctx.accept(Some(identity)).await.unwrap()
    }

    fn to_json(reply: &Outbound) -> Value {
        serde_json::to_value(reply).unwrap()
    }

    #[tokio::test]
    async fn accept_resolves_roles_and_rejects_anonymous() {
        let ctx = context();
        assert_eq!(session_for(&ctx, "ada").await.role, Role::Admin);
        assert_eq!(session_for(&ctx, "stranger").await.role, Role::Operator);
        assert_eq!(ctx.accept(None).await, Err(CloseReason::Unauthenticated));
        assert_eq!(ctx.accept(Some("  ")).await, Err(CloseReason::Unauthenticated));

        let broken = SessionContext::new(
            Engine::default(),
            Arc::new(BrokenLookup),
            Arc::new(UserDirectory::new()),
        );
        assert_eq!(broken.accept(Some("ada")).await, Err(CloseReason::InternalError));
    }

    #[tokio::test]
    async fn calibrate_updates_only_supplied_keys() {
        let ctx = context();
        let session = session_for(&ctx, "carl").await;
        let (tx, _rx) = mpsc::channel(4);

        let reply = ctx
            .dispatch(
                &session,
                r#"{"action":"calibrate","parameters":{"offset":2.0}}"#,
                &tx,
            )
            .await;
        let json = to_json(&reply);
        assert_eq!(json["type"], "response");
        assert_eq!(json["success"], true);
        assert_eq!(json["settings"], json!({ "offset": 2.0, "gain": 1.0, "filter": 0.5 }));
        assert_eq!(ctx.engine.settings.calibration().offset, 2.0);
    }

    #[tokio::test]
    async fn operator_is_denied_but_session_keeps_answering() {
        let ctx = context();
        let session = session_for(&ctx, "olga").await;
        let (tx, _rx) = mpsc::channel(4);

        let denied = ctx
            .dispatch(
                &session,
                r#"{"action":"admin_action","command":"restart_service"}"#,
                &tx,
            )
            .await;
        assert_eq!(denied.kind(), Some(ErrorKind::PermissionDenied));

        let denied = ctx
            .dispatch(&session, r#"{"action":"calibrate","parameters":{"gain":3}}"#, &tx)
            .await;
        assert_eq!(denied.kind(), Some(ErrorKind::PermissionDenied));
        assert_eq!(ctx.engine.settings.calibration().gain, 1.0);

        let status = to_json(&ctx.dispatch(&session, r#"{"action":"get_status"}"#, &tx).await);
        assert_eq!(status["type"], "status");
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_get_typed_errors() {
        let ctx = context();
        let session = session_for(&ctx, "ada").await;
        let (tx, _rx) = mpsc::channel(4);

        let cases = [
            ("not json", ErrorKind::Malformed),
            (r#"{"parameters":{}}"#, ErrorKind::Malformed),
            (r#"{"action":"self_destruct"}"#, ErrorKind::UnknownAction),
            (r#"{"action":"admin_action","command":"format_disk"}"#, ErrorKind::UnknownAction),
            (r#"{"action":"calibrate","parameters":[1,2]}"#, ErrorKind::Validation),
            (r#"{"action":"calibrate","parameters":{"bogus":1}}"#, ErrorKind::Rejected),
        ];
        for (frame, kind) in cases {
            assert_eq!(ctx.dispatch(&session, frame, &tx).await.kind(), Some(kind), "{frame}");
        }
    }

    #[tokio::test]
    async fn add_user_reports_duplicates_as_failure() {
        let ctx = context();
        let session = session_for(&ctx, "ada").await;
        let (tx, _rx) = mpsc::channel(4);

        let created = to_json(
            &ctx.dispatch(
                &session,
                r#"{"action":"admin_action","command":"add_user","parameters":{"username":"bea","password":"pw","role":"calibrator"}}"#,
                &tx,
            )
            .await,
        );
        assert_eq!(created["success"], true);
        assert_eq!(session_for(&ctx, "bea").await.role, Role::Calibrator);

        let duplicate = to_json(
            &ctx.dispatch(
                &session,
                r#"{"action":"admin_action","command":"add_user","parameters":{"username":"bea","password":"pw"}}"#,
                &tx,
            )
            .await,
        );
        assert_eq!(duplicate["success"], false);
        assert_eq!(duplicate["message"], "Username already exists");
    }

    #[tokio::test(start_paused = true)]
    async fn restart_service_acknowledges_twice() {
        let ctx = context();
        let session = session_for(&ctx, "ada").await;
        let (tx, mut rx) = mpsc::channel(4);

        let first = to_json(
            &ctx.dispatch(
                &session,
                r#"{"action":"admin_action","command":"restart_service"}"#,
                &tx,
            )
            .await,
        );
        assert_eq!(first["success"], true);
        assert!(rx.try_recv().is_err());

        let started = time::Instant::now();
        let second = to_json(&rx.recv().await.unwrap());
        assert_eq!(second["message"], "Service restarted successfully.");
        assert!(started.elapsed() >= RESTART_SIMULATION);
    }

    #[tokio::test]
    async fn update_settings_reports_rejected_keys() {
        let ctx = context();
        let session = session_for(&ctx, "ada").await;
        let (tx, _rx) = mpsc::channel(4);

        let reply = to_json(
            &ctx.dispatch(
                &session,
                r#"{"action":"admin_action","command":"update_settings","parameters":{"port":70000,"buffer_size":"2048"}}"#,
                &tx,
            )
            .await,
        );
        assert_eq!(reply["success"], true);
        assert_eq!(reply["settings"]["buffer_size"], 2048);
        assert_eq!(reply["settings"]["port"], 2345);
        assert_eq!(reply["rejected"][0]["key"], "port");
    }
}
