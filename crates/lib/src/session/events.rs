/// Progress notifications sent on a session's event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
  JobStarted { rule: String },
  UpToDate { rule: String },
  /// Outputs recorded for the rule are about to be removed before it runs.
  CleanOutputs { rule: String, outputs: Vec<String> },
  RecipeStarted { rule: String },
  JobFinished { rule: String, executed: bool },
  JobFailed { rule: String, error: String },
}

impl BuildEvent {
  pub fn rule(&self) -> &str {
    match self {
      BuildEvent::JobStarted { rule }
      | BuildEvent::UpToDate { rule }
      | BuildEvent::CleanOutputs { rule, .. }
      | BuildEvent::RecipeStarted { rule }
      | BuildEvent::JobFinished { rule, .. }
      | BuildEvent::JobFailed { rule, .. } => rule,
    }
  }
}
