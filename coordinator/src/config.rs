//! Coordinator configuration.

use std::path::PathBuf;
use std::time::Duration;

use clusterroll_common::time::constants::TRANSCRIPT_RETENTION_DAYS;
use clusterroll_common::NodeName;

/// Scheduled task configuration.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Name of the cluster-wide coordinator task.
    pub name: String,
    /// Name of the node-local task that re-enables the coordinator at boot.
    pub helper_name: String,
    /// Path of the coordinator executable. Must be identical on every node.
    pub executable: String,
    /// Global options every scheduled run passes before its command, so
    /// ticks use the same store and logging as the operator who started them.
    pub forwarded_arguments: Vec<String>,
    /// Repetition interval of the cluster-wide task.
    pub interval: Duration,
    /// Attempts of the at-boot resume before giving up.
    pub resume_attempts: u32,
    /// Pause between at-boot resume attempts.
    pub resume_retry_delay: Duration,
}

impl TaskConfig {
    /// Arguments of the cluster-wide task.
    pub fn tick_arguments(&self) -> Vec<String> {
        self.command_line(&["tick"])
    }

    /// Arguments of the node-local task run at boot.
    pub fn resume_arguments(&self) -> Vec<String> {
        self.command_line(&["resume", "--at-boot"])
    }

    fn command_line(&self, command: &[&str]) -> Vec<String> {
        self.forwarded_arguments
            .iter()
            .cloned()
            .chain(command.iter().map(|arg| arg.to_string()))
            .collect()
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            name: "ClusterRollingRestart".to_string(),
            helper_name: "ClusterRollingRestart-ResumeAfterReboot".to_string(),
            executable: "C:\\Program Files\\ClusterRoll\\clusterroll.exe".to_string(),
            forwarded_arguments: Vec::new(),
            interval: Duration::from_secs(60),
            resume_attempts: 30,
            resume_retry_delay: Duration::from_secs(10),
        }
    }
}

/// Where the rollout state lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    /// In the coordinator task's description field.
    TaskDescription,
    /// In a JSON file every node can reach (e.g. a cluster shared volume).
    File { path: PathBuf },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::TaskDescription
    }
}

/// Transcript configuration.
#[derive(Debug, Clone)]
pub struct TranscriptConfig {
    /// Write a transcript file.
    pub enabled: bool,
    /// Directory for transcript files.
    pub directory: PathBuf,
    /// Days of transcripts to keep.
    pub retention_days: u32,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("C:\\ProgramData\\ClusterRoll\\Logs"),
            retention_days: TRANSCRIPT_RETENTION_DAYS,
        }
    }
}

/// Main coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Cluster name of the local node. Defaults to the computer name.
    pub node_name: Option<String>,
    /// Scheduled task configuration.
    pub task: TaskConfig,
    /// State store configuration.
    pub store: StoreConfig,
    /// Transcript configuration.
    pub transcript: TranscriptConfig,
    /// Resource group whose owner removes the task at the end.
    pub quorum_group: String,
    /// PowerShell executable used by the production adapters.
    pub powershell: String,
    /// Write log lines to the console.
    pub console_output: bool,
    /// Log level.
    pub log_level: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_name: None,
            task: TaskConfig::default(),
            store: StoreConfig::default(),
            transcript: TranscriptConfig::default(),
            quorum_group: "Cluster Group".to_string(),
            powershell: "powershell.exe".to_string(),
            console_output: true,
            log_level: "info".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.node_name = std::env::var("CLUSTERROLL_NODE_NAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .ok();

        if let Ok(name) = std::env::var("CLUSTERROLL_TASK_NAME") {
            config.task.helper_name = format!("{}-ResumeAfterReboot", name);
            config.task.name = name;
        }

        if let Ok(exe) = std::env::var("CLUSTERROLL_EXECUTABLE") {
            config.task.executable = exe;
        } else if let Ok(exe) = std::env::current_exe() {
            config.task.executable = exe.display().to_string();
        }

        if let Ok(path) = std::env::var("CLUSTERROLL_STATE_FILE") {
            if !path.is_empty() {
                config.store = StoreConfig::File {
                    path: PathBuf::from(path),
                };
            }
        }

        if let Ok(dir) = std::env::var("CLUSTERROLL_TRANSCRIPT_DIR") {
            config.transcript.directory = PathBuf::from(dir);
        }

        if let Ok(days) = std::env::var("CLUSTERROLL_TRANSCRIPT_RETENTION_DAYS") {
            if let Ok(days) = days.parse() {
                config.transcript.retention_days = days;
            }
        }

        if let Ok(attempts) = std::env::var("CLUSTERROLL_RESUME_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse() {
                config.task.resume_attempts = attempts;
            }
        }

        if let Ok(group) = std::env::var("CLUSTERROLL_QUORUM_GROUP") {
            config.quorum_group = group;
        }

        if let Ok(ps) = std::env::var("CLUSTERROLL_POWERSHELL") {
            config.powershell = ps;
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Task configuration for scheduled runs, carrying the global options
    /// that differ from what a bare run would pick up.
    ///
    /// The node name is never forwarded: the cluster-wide task runs on
    /// every node.
    pub fn scheduled_task(&self) -> TaskConfig {
        let mut forwarded = Vec::new();
        if let StoreConfig::File { path } = &self.store {
            forwarded.push("--state-file".to_string());
            forwarded.push(path.display().to_string());
        }
        if !self.transcript.enabled {
            forwarded.push("--skip-transcript".to_string());
        }
        if !self.console_output {
            forwarded.push("--skip-text-output".to_string());
        }

        TaskConfig {
            forwarded_arguments: forwarded,
            ..self.task.clone()
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.task.name.is_empty() {
            return Err("Task name cannot be empty".to_string());
        }

        if self.task.helper_name == self.task.name {
            return Err("Helper task name must differ from the coordinator task name".to_string());
        }

        if self.task.executable.is_empty() {
            return Err("Coordinator executable path cannot be empty".to_string());
        }

        if self.task.interval.is_zero() {
            return Err("Task interval cannot be 0".to_string());
        }

        if let StoreConfig::File { path } = &self.store {
            if path.as_os_str().is_empty() {
                return Err("State file path cannot be empty".to_string());
            }
        }

        if self.task.resume_attempts == 0 {
            return Err("Resume attempts cannot be 0".to_string());
        }

        if self.quorum_group.is_empty() {
            return Err("Quorum group name cannot be empty".to_string());
        }

        match &self.node_name {
            Some(name) if NodeName::new(name.as_str()).is_valid() => Ok(()),
            Some(name) => Err(format!("Invalid local node name: {:?}", name)),
            None => Err("Local node name is unknown; set CLUSTERROLL_NODE_NAME".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            node_name: Some("HV01".to_string()),
            ..CoordinatorConfig::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.store, StoreConfig::TaskDescription);
        assert_eq!(config.task.interval, Duration::from_secs(60));
    }

    #[test]
    fn test_missing_node_name() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = create_test_config();
        config.task.helper_name = config.task.name.clone();
        assert!(config.validate().is_err());

        let mut config = create_test_config();
        config.store = StoreConfig::File {
            path: PathBuf::new(),
        };
        assert!(config.validate().is_err());

        let mut config = create_test_config();
        config.node_name = Some("hv_01".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scheduled_task_forwards_store_and_logging() {
        let config = create_test_config();
        let task = config.scheduled_task();
        assert_eq!(task.tick_arguments(), vec!["tick"]);
        assert_eq!(task.resume_arguments(), vec!["resume", "--at-boot"]);

        let mut config = create_test_config();
        config.store = StoreConfig::File {
            path: PathBuf::from("C:\\ClusterStorage\\Volume1\\roll.json"),
        };
        config.console_output = false;
        let task = config.scheduled_task();
        assert_eq!(
            task.tick_arguments(),
            vec![
                "--state-file",
                "C:\\ClusterStorage\\Volume1\\roll.json",
                "--skip-text-output",
                "tick"
            ]
        );
        assert_eq!(
            task.resume_arguments()[..3],
            ["--state-file", "C:\\ClusterStorage\\Volume1\\roll.json", "--skip-text-output"]
        );
        assert!(!task.tick_arguments().iter().any(|arg| arg == "--node"));
    }
}
