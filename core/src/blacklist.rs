use std::sync::RwLock;

use conveyor_lib::CommitHash;
use serde::{Deserialize, Serialize};

/// One rule in the blacklist store. Empty fields match everything, so a
/// rule can target a task name everywhere, a whole repo, or specific
/// commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistRule {
    pub name: String,
    /// Task names to block; empty blocks every name.
    #[serde(default)]
    pub task_names: Vec<String>,
    /// Repo to block; `None` blocks every repo.
    #[serde(default)]
    pub repo: Option<String>,
    /// Commits to block; empty blocks every revision.
    #[serde(default)]
    pub commits: Vec<CommitHash>,
    #[serde(default)]
    pub description: String,
}

impl BlacklistRule {
    fn matches(&self, task_name: &str, repo: &str, revision: &CommitHash) -> bool {
        if !self.task_names.is_empty() && !self.task_names.iter().any(|n| n == task_name) {
            return false;
        }
        if let Some(rule_repo) = &self.repo {
            if rule_repo != repo {
                return false;
            }
        }
        if !self.commits.is_empty() && !self.commits.contains(revision) {
            return false;
        }
        true
    }
}

/// The rule store the candidate filter consults. Rules are managed
/// externally; the scheduler only reads them and reports the active set.
#[derive(Default)]
pub struct Blacklist {
    rules: RwLock<Vec<BlacklistRule>>,
}

impl Blacklist {
    pub fn new(rules: Vec<BlacklistRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    pub fn add_rule(&self, rule: BlacklistRule) {
        let mut rules = self.rules.write().unwrap();
        rules.retain(|r| r.name != rule.name);
        rules.push(rule);
    }

    pub fn remove_rule(&self, name: &str) {
        self.rules.write().unwrap().retain(|r| r.name != name);
    }

    pub fn rules(&self) -> Vec<BlacklistRule> {
        self.rules.read().unwrap().clone()
    }

    /// Name of the first active rule matching the triple, if any.
    pub fn first_match(
        &self,
        task_name: &str,
        repo: &str,
        revision: &CommitHash,
    ) -> Option<String> {
        self.rules
            .read()
            .unwrap()
            .iter()
            .find(|r| r.matches(task_name, repo, revision))
            .map(|r| r.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(b: u8) -> CommitHash {
        CommitHash::new([b; 20])
    }

    #[test]
    fn test_rule_scoping() {
        let bl = Blacklist::default();
        bl.add_rule(BlacklistRule {
            name: "bad-commit".into(),
            task_names: vec![],
            repo: Some("repo".into()),
            commits: vec![hash(3)],
            description: "broken roll".into(),
        });

        assert_eq!(
            bl.first_match("Build", "repo", &hash(3)),
            Some("bad-commit".into())
        );
        assert_eq!(bl.first_match("Build", "repo", &hash(4)), None);
        assert_eq!(bl.first_match("Build", "other", &hash(3)), None);
    }

    #[test]
    fn test_add_replaces_and_remove() {
        let bl = Blacklist::default();
        bl.add_rule(BlacklistRule {
            name: "r".into(),
            task_names: vec!["Build".into()],
            repo: None,
            commits: vec![],
            description: String::new(),
        });
        bl.add_rule(BlacklistRule {
            name: "r".into(),
            task_names: vec!["Test".into()],
            repo: None,
            commits: vec![],
            description: String::new(),
        });
        assert_eq!(bl.rules().len(), 1);
        assert_eq!(bl.first_match("Build", "repo", &hash(1)), None);
        assert!(bl.first_match("Test", "repo", &hash(1)).is_some());

        bl.remove_rule("r");
        assert!(bl.rules().is_empty());
    }
}
