//! Typed-phrase confirmation for destructive operations.

use std::io::{BufRead, Write};
use std::sync::Mutex;

/// Asks an operator to approve a destructive action.
pub trait Confirmer: Send + Sync {
    /// Show `details`, then accept only an exact match of `phrase`.
    fn confirm(&self, details: &[String], phrase: &str) -> bool;
}

/// Phrase required to restore a single service.
pub fn restore_phrase(service: &str) -> String {
    format!("RESTORE {}", service)
}

/// Interactive confirmation on the controlling terminal.
#[derive(Debug, Default)]
pub struct StdinConfirmer;

impl Confirmer for StdinConfirmer {
    fn confirm(&self, details: &[String], phrase: &str) -> bool {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr);
        for line in details {
            let _ = writeln!(stderr, "  {}", line);
        }
        let _ = write!(stderr, "\nType '{}' to continue: ", phrase);
        let _ = stderr.flush();

        let mut input = String::new();
        if std::io::stdin().lock().read_line(&mut input).is_err() {
            return false;
        }
        input.trim_end_matches(['\r', '\n']) == phrase
    }
}

/// Answers every prompt with a fixed reply and remembers what was shown.
#[derive(Debug, Default)]
pub struct ScriptedConfirmer {
    reply: String,
    shown: Mutex<Vec<String>>,
}

impl ScriptedConfirmer {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            shown: Mutex::new(Vec::new()),
        }
    }

    /// Every detail line shown so far.
    pub fn shown(&self) -> Vec<String> {
        self.shown.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn asked(&self) -> bool {
        !self.shown().is_empty()
    }
}

impl Confirmer for ScriptedConfirmer {
    fn confirm(&self, details: &[String], phrase: &str) -> bool {
        if let Ok(mut shown) = self.shown.lock() {
            shown.extend(details.iter().cloned());
            shown.push(format!("phrase: {}", phrase));
        }
        self.reply == phrase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_only() {
        let details = vec!["artifact: /backups/redis/x.tar.zst.enc".to_string()];
        assert!(ScriptedConfirmer::new("RESTORE redis").confirm(&details, "RESTORE redis"));
        assert!(!ScriptedConfirmer::new("restore redis").confirm(&details, "RESTORE redis"));
        assert!(!ScriptedConfirmer::new("RESTORE redis ").confirm(&details, "RESTORE redis"));
        assert!(!ScriptedConfirmer::new("yes").confirm(&details, "RESTORE redis"));
    }

    #[test]
    fn test_details_are_recorded() {
        let confirmer = ScriptedConfirmer::new("no");
        confirmer.confirm(&["target: db 0".to_string()], &restore_phrase("redis"));
        assert_eq!(confirmer.shown(), vec!["target: db 0", "phrase: RESTORE redis"]);
    }
}
