use serde::{Deserialize, Serialize};

/// Environment variable the scheduler sidecar reads its configuration from.
pub const SCHEDULER_CONFIG_ENV: &str = "SCHEDULER_CONFIG";

/// JSON handed to the scheduler sidecar: the idle app container to exec into
/// and the cronjob definitions to run against it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SchedulerConfig {
    pub container_id: String,
    pub jobs: Vec<SchedulerJob>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SchedulerJob {
    pub name: String,
    pub command: String,
    pub schedule: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let config: SchedulerConfig = serde_json::from_str(
            r#"{"container_id":"abc123","jobs":[{"name":"tick","command":"date","schedule":"* * * * *"}]}"#,
        )
        .unwrap();

        assert_eq!(config.container_id, "abc123");
        assert_eq!(config.jobs[0].name, "tick");

        let round_tripped = serde_json::to_string(&config).unwrap();
        assert!(round_tripped.contains("\"schedule\":\"* * * * *\""));
    }
}
