use meridian_core::{AgentIdentity, Instance, Timestamp, DEFAULT_PLACE};
use std::path::Path;

pub(crate) fn identity_for(package: &Path, hash: &str) -> AgentIdentity {
    AgentIdentity {
        name: "Ping".to_string(),
        class_name: "agents.ping.Ping".to_string(),
        organisation: "Meridian".to_string(),
        hash: hash.to_string(),
        major: 1,
        minor: 0,
        description: "Replies to pings".to_string(),
        package: package.display().to_string(),
    }
}

pub(crate) fn instance(created_at: Timestamp) -> Instance {
    let identity = identity_for(Path::new("/tmp/ping.pkg"), &"ab".repeat(32));
    Instance::new(identity, created_at, DEFAULT_PLACE, vec![])
}
