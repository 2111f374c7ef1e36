//! Administrative text protocol
//!
//! Newline-terminated ASCII commands used for introspection, e.g.
//! `status` or `workers`. Multi-line responses end with a lone `.` line.

/// Known admin commands
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::module_name_repetitions)]
pub enum AdminCommand {
    /// Per-function queue summary
    Status,
    /// Connected peers and their capabilities
    Workers,
    /// Server version
    Version,
    /// Every outstanding job
    ShowJobs,
    /// Outstanding jobs that carry a unique token
    ShowUniqueJobs,
    /// Remove a still-queued job
    CancelJob(String),
    /// Anything else
    Unknown(String),
}

impl AdminCommand {
    /// Parse one admin line
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let words: Vec<&str> = line.split_whitespace().collect();
        let lowered: Vec<String> = words.iter().map(|w| w.to_ascii_lowercase()).collect();
        let lowered: Vec<&str> = lowered.iter().map(String::as_str).collect();

        match lowered.as_slice() {
            ["status"] => AdminCommand::Status,
            ["workers"] => AdminCommand::Workers,
            ["version"] => AdminCommand::Version,
            ["show", "jobs"] => AdminCommand::ShowJobs,
            ["show", "unique", "jobs"] => AdminCommand::ShowUniqueJobs,
            ["cancel", "job", _] => AdminCommand::CancelJob(words[2].to_string()),
            _ => AdminCommand::Unknown(line.trim().to_string()),
        }
    }
}

/// One line of `status` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionStatus {
    /// Function name
    pub name: String,
    /// Queued plus running jobs
    pub total: usize,
    /// Jobs assigned to a worker
    pub running: usize,
    /// Connections that registered the function
    pub workers: usize,
}

/// One line of `workers` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Server-side connection id
    pub connection_id: u64,
    /// Remote address
    pub address: String,
    /// Identifier sent with SET_CLIENT_ID, `-` if none
    pub client_id: String,
    /// Registered functions in registration order
    pub functions: Vec<String>,
}

/// One line of `show jobs` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    /// Job handle
    pub handle: String,
    /// Function name
    pub function: String,
    /// Unique token if one was given
    pub unique: Option<String>,
    /// Whether a worker holds the job
    pub running: bool,
    /// Attached foreground clients
    pub clients: usize,
}

/// Render `status` output
#[must_use]
pub fn format_status(rows: &[FunctionStatus]) -> String {
    let mut out = String::new();
    for row in rows {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\n",
            row.name, row.total, row.running, row.workers
        ));
    }
    out.push_str(".\n");
    out
}

/// Render `workers` output
#[must_use]
pub fn format_workers(rows: &[WorkerInfo]) -> String {
    let mut out = String::new();
    for row in rows {
        out.push_str(&format!(
            "{} {} {} :",
            row.connection_id, row.address, row.client_id
        ));
        for function in &row.functions {
            out.push(' ');
            out.push_str(function);
        }
        out.push('\n');
    }
    out.push_str(".\n");
    out
}

/// Render `show jobs` output
#[must_use]
pub fn format_jobs(rows: &[JobInfo]) -> String {
    let mut out = String::new();
    for row in rows {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\n",
            row.handle,
            u8::from(row.running),
            row.clients,
            row.function
        ));
    }
    out.push_str(".\n");
    out
}

/// Render `show unique jobs` output
#[must_use]
pub fn format_unique_jobs(rows: &[JobInfo]) -> String {
    let mut out = String::new();
    for unique in rows.iter().filter_map(|row| row.unique.as_deref()) {
        out.push_str(unique);
        out.push('\n');
    }
    out.push_str(".\n");
    out
}

/// Response for an unrecognised command
#[must_use]
pub fn unknown_command() -> String {
    "ERR UNKNOWN_COMMAND Unknown+server+command\n".to_string()
}
