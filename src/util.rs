use std::collections::HashMap;
use std::env;
use std::path::Path;

use chrono::Utc;
use log::{debug, warn};
use uuid::Uuid;
use zbus::Connection;

/// Mints a startup id for a freshly registering client: a leading version
/// digit, a random uuid, and a millisecond timestamp for uniqueness across
/// daemon restarts.
pub fn generate_startup_id() -> String {
    format!(
        "1{}{}",
        Uuid::new_v4().simple(),
        Utc::now().timestamp_millis()
    )
}

/// The network id advertised for a listening socket, in the classic
/// `unix/<host>:<path>` form.
pub fn network_id(socket_path: &Path) -> String {
    let host = env::var("HOSTNAME")
        .unwrap_or_else(|_| gethostname::gethostname().to_string_lossy().to_string());
    format!("unix/{}:{}", host, socket_path.display())
}

/// Publishes `SESSION_MANAGER` to our own environment and, when a bus is
/// available, to the activation environment of bus-launched applications.
/// A missing bus only costs a warning.
pub async fn publish_session_env(network_id: &str, connection: Option<&Connection>) {
    env::set_var("SESSION_MANAGER", network_id);
    debug!("util: SESSION_MANAGER={}", network_id);

    let Some(connection) = connection else {
        return;
    };
    let mut vars = HashMap::new();
    vars.insert("SESSION_MANAGER", network_id);
    let result = match zbus::fdo::DBusProxy::new(connection).await {
        Ok(proxy) => proxy.update_activation_environment(vars).await,
        Err(err) => {
            warn!("util: no bus daemon proxy: {}", err);
            return;
        }
    };
    if let Err(err) = result {
        warn!(
            "util: could not publish SESSION_MANAGER to the activation environment: {}",
            err
        );
    }
}
