//! Production adapters backed by PowerShell cmdlets.
//!
//! Every call spawns `powershell.exe -NoProfile -NonInteractive -Command`
//! and reads one compressed JSON document from stdout.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, trace};

use clusterroll_common::{ClusterRollError, NodeName, Result, Timestamp};

use crate::cluster::{ClusterApi, HostControl};
use crate::environment::{
    ClusterTask, DrainMode, NodeLiveState, NodeStatus, NodeStatusInfo, StorageJob,
    TaskDefinition, TaskTrigger,
};
use crate::scheduler::TaskScheduler;

/// Quote `value` as a PowerShell single-quoted string.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Path of `path` on `node` through its administrative share.
pub fn admin_share_path(node: &NodeName, path: &str) -> Result<String> {
    let mut chars = path.chars();
    match (chars.next(), chars.next()) {
        (Some(drive), Some(':')) if drive.is_ascii_alphabetic() => {
            let rest = chars.as_str().trim_start_matches(['\\', '/']);
            Ok(format!("\\\\{}\\{}$\\{}", node, drive.to_ascii_uppercase(), rest))
        }
        _ => Err(ClusterRollError::Configuration(format!(
            "coordinator path must be a local absolute path: {}",
            path
        ))),
    }
}

/// Wrap `expression` so its result is written as compressed JSON.
fn as_json(expression: &str) -> String {
    format!(
        "$ErrorActionPreference = 'Stop'; ConvertTo-Json -Compress -Depth 4 -InputObject @({})",
        expression
    )
}

fn bool_literal(value: bool) -> &'static str {
    if value {
        "$true"
    } else {
        "$false"
    }
}

fn date_literal(at: &Timestamp) -> String {
    format!("([datetime]::Parse({}))", quote(&at.to_rfc3339()))
}

fn action_script(definition: &TaskDefinition) -> String {
    let arguments = definition.argument_line();
    if arguments.is_empty() {
        format!(
            "$action = New-ScheduledTaskAction -Execute {}",
            quote(&definition.execute)
        )
    } else {
        format!(
            "$action = New-ScheduledTaskAction -Execute {} -Argument {}",
            quote(&definition.execute),
            quote(&arguments)
        )
    }
}

fn trigger_script(trigger: &TaskTrigger) -> String {
    match trigger {
        TaskTrigger::Repeating {
            start,
            interval,
            duration,
        } => format!(
            "$trigger = New-ScheduledTaskTrigger -Once -At {} -RepetitionInterval (New-TimeSpan -Minutes {}) -RepetitionDuration (New-TimeSpan -Days {})",
            date_literal(start),
            interval.num_minutes().max(1),
            duration.num_days().max(1)
        ),
        // Give the cluster service a head start.
        TaskTrigger::AtStartup => {
            "$trigger = New-ScheduledTaskTrigger -AtStartup; $trigger.Delay = 'PT1M'".to_string()
        }
    }
}

/// Script registering the cluster-wide coordinator task.
pub fn register_cluster_task_script(definition: &TaskDefinition) -> String {
    let disable = if definition.enabled { "" } else { " -Disable" };
    [
        "$ErrorActionPreference = 'Stop'".to_string(),
        action_script(definition),
        trigger_script(&definition.trigger),
        format!("$settings = New-ScheduledTaskSettingsSet -MultipleInstances IgnoreNew{}", disable),
        format!(
            "Register-ClusteredScheduledTask -TaskName {} -TaskType ClusterWide -Action $action -Trigger $trigger -Settings $settings -Description {} | Out-Null",
            quote(&definition.name),
            quote(&definition.description)
        ),
    ]
    .join("; ")
}

/// Script registering a task on the local machine, run as SYSTEM. Task
/// Scheduler restarts it if it fails.
pub fn register_local_task_script(definition: &TaskDefinition) -> String {
    [
        "$ErrorActionPreference = 'Stop'".to_string(),
        action_script(definition),
        trigger_script(&definition.trigger),
        "$settings = New-ScheduledTaskSettingsSet -RestartCount 3 -RestartInterval (New-TimeSpan -Minutes 1)".to_string(),
        format!(
            "Register-ScheduledTask -TaskName {} -Action $action -Trigger $trigger -Settings $settings -User 'NT AUTHORITY\\SYSTEM' -RunLevel Highest -Description {} -Force | Out-Null",
            quote(&definition.name),
            quote(&definition.description)
        ),
    ]
    .join("; ")
}

/// Script draining `node`.
pub fn suspend_node_script(node: &NodeName, mode: DrainMode) -> String {
    let force = match mode {
        DrainMode::Graceful => "",
        DrainMode::Forced => " -ForceDrain",
    };
    format!(
        "$ErrorActionPreference = 'Stop'; Suspend-ClusterNode -Name {} -Drain -Wait{} | Out-Null",
        quote(node.as_str()),
        force
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsNode {
    name: String,
    state: String,
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsStorageJob {
    name: String,
    job_state: String,
    #[serde(default)]
    percent_complete: Option<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsTask {
    name: String,
    #[serde(default)]
    description: Option<String>,
    enabled: bool,
    #[serde(default)]
    start_boundary: Option<Timestamp>,
}

impl From<PsTask> for ClusterTask {
    fn from(task: PsTask) -> Self {
        ClusterTask {
            name: task.name,
            description: task.description.unwrap_or_default(),
            enabled: task.enabled,
            start_boundary: task.start_boundary,
        }
    }
}

/// Runs PowerShell scripts.
#[derive(Debug, Clone)]
pub struct PowerShell {
    executable: String,
}

impl PowerShell {
    /// Use the PowerShell binary at `executable`.
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Run `script`, returning stdout. Failures are wrapped with `err`.
    pub async fn run(
        &self,
        script: &str,
        err: fn(String) -> ClusterRollError,
    ) -> Result<String> {
        trace!(script = %script, "Running PowerShell");
        let output = Command::new(&self.executable)
            .args(["-NoProfile", "-NonInteractive", "-Command", script])
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(err(format!(
                "exit {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run `script` and decode its JSON output.
    pub async fn json<T: DeserializeOwned>(
        &self,
        script: &str,
        err: fn(String) -> ClusterRollError,
    ) -> Result<T> {
        let text = self.run(script, err).await?;
        serde_json::from_str(&text).map_err(|e| err(format!("unexpected output {:?}: {}", text, e)))
    }
}

/// Cluster, scheduler and host adapters for one node.
#[derive(Debug, Clone)]
pub struct PowerShellCluster {
    shell: PowerShell,
    local: NodeName,
    quorum_group: String,
}

impl PowerShellCluster {
    /// Create adapters for `local`.
    pub fn new(shell: PowerShell, local: NodeName, quorum_group: impl Into<String>) -> Self {
        Self {
            shell,
            local,
            quorum_group: quorum_group.into(),
        }
    }

    async fn cluster(&self, script: &str) -> Result<String> {
        self.shell.run(script, ClusterRollError::ClusterApi).await
    }

    async fn tasks(&self, script: &str) -> Result<String> {
        self.shell.run(script, ClusterRollError::TaskScheduler).await
    }

    /// Rewrite the coordinator task's definition in place.
    async fn update_task(&self, name: &str, assignment: &str) -> Result<()> {
        if self.cluster_task(name).await?.is_none() {
            return Err(ClusterRollError::TaskNotFound(name.to_string()));
        }
        let script = format!(
            "$ErrorActionPreference = 'Stop'; $task = Get-ClusteredScheduledTask -TaskName {name}; $definition = $task.TaskDefinition; {assignment}; Set-ClusteredScheduledTask -TaskName {name} -TaskDefinition $definition | Out-Null",
            name = quote(name),
            assignment = assignment
        );
        self.tasks(&script).await.map(|_| ())
    }
}

impl ClusterApi for PowerShellCluster {
    async fn nodes(&self) -> Result<Vec<NodeStatus>> {
        let script = as_json(
            "Get-ClusterNode | ForEach-Object { [pscustomobject]@{ Name = $_.Name; State = \"$($_.State)\"; Status = \"$($_.StatusInformation)\" } }",
        );
        let nodes: Vec<PsNode> = self.shell.json(&script, ClusterRollError::ClusterApi).await?;
        Ok(nodes
            .into_iter()
            .map(|n| {
                NodeStatus::new(
                    n.name,
                    NodeLiveState::parse(&n.state),
                    NodeStatusInfo::parse(&n.status),
                )
            })
            .collect())
    }

    async fn storage_jobs(&self, node: &NodeName) -> Result<Vec<StorageJob>> {
        let script = as_json(&format!(
            "Get-StorageJob -CimSession {} | Where-Object {{ \"$($_.JobState)\" -ne 'Completed' }} | ForEach-Object {{ [pscustomobject]@{{ Name = $_.Name; JobState = \"$($_.JobState)\"; PercentComplete = $_.PercentComplete }} }}",
            quote(node.as_str())
        ));
        let jobs: Vec<PsStorageJob> = self.shell.json(&script, ClusterRollError::ClusterApi).await?;
        Ok(jobs
            .into_iter()
            .map(|j| StorageJob {
                name: j.name,
                state: j.job_state,
                percent_complete: j.percent_complete.unwrap_or(0),
            })
            .collect())
    }

    async fn quorum_owner(&self) -> Result<NodeName> {
        let script = as_json(&format!(
            "\"$((Get-ClusterGroup -Name {}).OwnerNode.Name)\"",
            quote(&self.quorum_group)
        ));
        let owners: Vec<String> = self.shell.json(&script, ClusterRollError::ClusterApi).await?;
        owners
            .into_iter()
            .find(|o| !o.is_empty())
            .map(NodeName::from)
            .ok_or_else(|| {
                ClusterRollError::ClusterApi(format!("group {} has no owner", self.quorum_group))
            })
    }

    async fn suspend_node(&self, node: &NodeName, mode: DrainMode) -> Result<()> {
        debug!(node = %node, mode = ?mode, "Suspend-ClusterNode");
        self.cluster(&suspend_node_script(node, mode)).await.map(|_| ())
    }

    async fn resume_node(&self, node: &NodeName) -> Result<()> {
        let script = format!(
            "$ErrorActionPreference = 'Stop'; Resume-ClusterNode -Name {} -Failback NoFailback | Out-Null",
            quote(node.as_str())
        );
        self.cluster(&script).await.map(|_| ())
    }

    async fn script_present(&self, node: &NodeName, path: &str) -> Result<bool> {
        let remote = admin_share_path(node, path)?;
        let script = as_json(&format!("Test-Path -LiteralPath {}", quote(&remote)));
        let present: Vec<bool> = self.shell.json(&script, ClusterRollError::ClusterApi).await?;
        Ok(present.first().copied().unwrap_or(false))
    }
}

impl TaskScheduler for PowerShellCluster {
    async fn cluster_task(&self, name: &str) -> Result<Option<ClusterTask>> {
        let script = as_json(&format!(
            "Get-ClusteredScheduledTask -TaskName {} -ErrorAction SilentlyContinue | ForEach-Object {{ $d = $_.TaskDefinition; $start = ($d.Triggers | Select-Object -First 1).StartBoundary; [pscustomobject]@{{ Name = $_.TaskName; Description = $d.RegistrationInfo.Description; Enabled = [bool]$d.Settings.Enabled; StartBoundary = $(if ($start) {{ ([datetime]$start).ToUniversalTime().ToString('o') }} else {{ $null }}) }} }}",
            quote(name)
        ));
        let tasks: Vec<PsTask> = self
            .shell
            .json(&script, ClusterRollError::TaskScheduler)
            .await?;
        Ok(tasks.into_iter().next().map(ClusterTask::from))
    }

    async fn register_cluster_task(&self, definition: &TaskDefinition) -> Result<()> {
        self.tasks(&register_cluster_task_script(definition))
            .await
            .map(|_| ())
    }

    async fn set_description(&self, name: &str, description: &str) -> Result<()> {
        self.update_task(
            name,
            &format!("$definition.RegistrationInfo.Description = {}", quote(description)),
        )
        .await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.update_task(
            name,
            &format!("$definition.Settings.Enabled = {}", bool_literal(enabled)),
        )
        .await
    }

    async fn unregister_cluster_task(&self, name: &str) -> Result<()> {
        if self.cluster_task(name).await?.is_none() {
            return Err(ClusterRollError::TaskNotFound(name.to_string()));
        }
        let script = format!(
            "$ErrorActionPreference = 'Stop'; Unregister-ClusteredScheduledTask -TaskName {}",
            quote(name)
        );
        self.tasks(&script).await.map(|_| ())
    }

    async fn register_local_task(&self, definition: &TaskDefinition) -> Result<()> {
        self.tasks(&register_local_task_script(definition))
            .await
            .map(|_| ())
    }

    async fn unregister_local_task(&self, name: &str) -> Result<()> {
        let script = format!(
            "Unregister-ScheduledTask -TaskName {} -Confirm:$false -ErrorAction SilentlyContinue",
            quote(name)
        );
        self.tasks(&script).await.map(|_| ())
    }
}

impl HostControl for PowerShellCluster {
    fn local_node(&self) -> NodeName {
        self.local.clone()
    }

    async fn last_boot_time(&self) -> Result<Timestamp> {
        let script = as_json(
            "(Get-CimInstance -ClassName Win32_OperatingSystem).LastBootUpTime.ToUniversalTime().ToString('o')",
        );
        let boots: Vec<Timestamp> = self
            .shell
            .json(&script, ClusterRollError::HostControl)
            .await?;
        boots
            .into_iter()
            .next()
            .ok_or_else(|| ClusterRollError::HostControl("no boot time reported".to_string()))
    }

    async fn restart(&self) -> Result<()> {
        self.shell
            .run("Restart-Computer -Force", ClusterRollError::HostControl)
            .await
            .map(|_| ())
    }
}
