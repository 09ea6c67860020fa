//! Candidate selection and confirmation
//!
//! Commands that need the operator to pick one of several resources, or to
//! approve a destructive change, take these traits instead of prompting
//! directly. Automated runs inject the non-interactive implementations.

use crate::error::{OpsError, Result};
use dialoguer::{Confirm, Select};

/// Chooses one entry from a list of candidates
pub trait SelectionStrategy {
    /// Pick a candidate; `what` names the kind of thing being chosen
    fn choose(&self, what: &str, candidates: &[String]) -> Result<usize>;

    /// Pick a candidate, short-circuiting the empty and single-entry cases
    fn select(&self, what: &str, candidates: &[String]) -> Result<usize> {
        match candidates.len() {
            0 => Err(OpsError::NoCandidates(what.to_string())),
            1 => Ok(0),
            _ => self.choose(what, candidates),
        }
    }
}

/// Always takes the first candidate
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstCandidate;

impl SelectionStrategy for FirstCandidate {
    fn choose(&self, what: &str, candidates: &[String]) -> Result<usize> {
        tracing::warn!("Multiple {} found, using '{}'", what, candidates[0]);
        Ok(0)
    }
}

/// Refuses to guess when more than one candidate exists
#[derive(Debug, Default, Clone, Copy)]
pub struct RequireUnique;

impl SelectionStrategy for RequireUnique {
    fn choose(&self, what: &str, candidates: &[String]) -> Result<usize> {
        Err(OpsError::AmbiguousSelection {
            what: what.to_string(),
            candidates: candidates.to_vec(),
        })
    }
}

/// Prompts on the terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct InteractiveSelect;

impl SelectionStrategy for InteractiveSelect {
    fn choose(&self, what: &str, candidates: &[String]) -> Result<usize> {
        let index = Select::new()
            .with_prompt(format!("Select {}", what))
            .items(candidates)
            .default(0)
            .interact()?;
        Ok(index)
    }
}

/// Pick the selector for the current session
pub fn default_selector(interactive: bool) -> Box<dyn SelectionStrategy> {
    if interactive && console::user_attended() {
        Box::new(InteractiveSelect)
    } else {
        Box::new(RequireUnique)
    }
}

/// Approves or declines a destructive operation
pub trait Confirmer {
    /// Ask the operator; `Ok(false)` means declined
    fn confirm(&self, prompt: &str) -> Result<bool>;

    /// Ask and turn a refusal into [`OpsError::ConfirmationDeclined`]
    fn require(&self, prompt: &str) -> Result<()> {
        if self.confirm(prompt)? {
            Ok(())
        } else {
            Err(OpsError::ConfirmationDeclined(prompt.to_string()))
        }
    }
}

/// Approves everything (`--yes` / `--force`)
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeYes;

impl Confirmer for AssumeYes {
    fn confirm(&self, _prompt: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Declines everything (non-interactive without `--yes`)
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeNo;

impl Confirmer for AssumeNo {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        tracing::warn!("Not confirmed (no terminal, pass --yes): {}", prompt);
        Ok(false)
    }
}

/// Yes/no prompt on the terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct InteractiveConfirm;

impl Confirmer for InteractiveConfirm {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        Ok(Confirm::new().with_prompt(prompt).default(false).interact()?)
    }
}

/// Pick the confirmer for the current session
pub fn default_confirmer(assume_yes: bool) -> Box<dyn Confirmer> {
    if assume_yes {
        Box::new(AssumeYes)
    } else if console::user_attended() {
        Box::new(InteractiveConfirm)
    } else {
        Box::new(AssumeNo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_candidate_needs_no_choice() {
        assert_eq!(RequireUnique.select("frontend", &names(&["fe1"])).unwrap(), 0);
    }

    #[test]
    fn test_empty_candidates() {
        let err = FirstCandidate.select("backend pool", &[]).unwrap_err();
        assert!(matches!(err, OpsError::NoCandidates(_)));
    }

    #[test]
    fn test_require_unique_lists_candidates() {
        let err = RequireUnique
            .select("frontend", &names(&["fe1", "fe2"]))
            .unwrap_err();
        match err {
            OpsError::AmbiguousSelection { candidates, .. } => assert_eq!(candidates.len(), 2),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_first_candidate() {
        assert_eq!(FirstCandidate.select("pool", &names(&["a", "b"])).unwrap(), 0);
    }

    #[test]
    fn test_confirmers() {
        assert!(AssumeYes.require("delete").is_ok());
        let err = AssumeNo.require("delete rule web").unwrap_err();
        assert!(matches!(err, OpsError::ConfirmationDeclined(_)));
    }
}
