use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const SCRIPT_PREFIX: &str = "script:";

/// Kind of work a worker is able to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Script,
    Api,
    Shell,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Script, Capability::Api, Capability::Shell];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Script => write!(f, "script"),
            Capability::Api => write!(f, "api"),
            Capability::Shell => write!(f, "shell"),
        }
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "script" => Ok(Capability::Script),
            "api" => Ok(Capability::Api),
            "shell" => Ok(Capability::Shell),
            other => Err(format!("unknown capability: {other}")),
        }
    }
}

/// A job command, classified once when the job is created.
///
/// `script:<path>` becomes [`JobCommand::Script`], `http://` and `https://`
/// URLs become [`JobCommand::ApiCall`], anything else runs as a shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum JobCommand {
    Script(String),
    ApiCall(String),
    Shell(String),
}

impl JobCommand {
    pub fn parse(raw: &str) -> Self {
        if let Some(path) = raw.strip_prefix(SCRIPT_PREFIX) {
            JobCommand::Script(path.to_string())
        } else if raw.starts_with("http://") || raw.starts_with("https://") {
            JobCommand::ApiCall(raw.to_string())
        } else {
            JobCommand::Shell(raw.to_string())
        }
    }

    pub fn capability(&self) -> Capability {
        match self {
            JobCommand::Script(_) => Capability::Script,
            JobCommand::ApiCall(_) => Capability::Api,
            JobCommand::Shell(_) => Capability::Shell,
        }
    }
}

impl fmt::Display for JobCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobCommand::Script(path) => write!(f, "{SCRIPT_PREFIX}{path}"),
            JobCommand::ApiCall(url) => write!(f, "{url}"),
            JobCommand::Shell(cmd) => write!(f, "{cmd}"),
        }
    }
}

impl From<String> for JobCommand {
    fn from(raw: String) -> Self {
        JobCommand::parse(&raw)
    }
}

impl From<JobCommand> for String {
    fn from(command: JobCommand) -> Self {
        command.to_string()
    }
}
