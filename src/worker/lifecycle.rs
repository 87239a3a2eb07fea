use std::fmt;

/// Lifecycle of one deployed worker version.
///
/// `Installing -> Installed -> Activating -> Active`, with `Redundant` reachable
/// from every non-terminal state (failed install, superseded version).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Installing,
  /// Installed and waiting for the previous version to let go
  Installed,
  Activating,
  Active,
  Redundant,
}

impl LifecycleState {
  pub fn can_transition_to(self, next: LifecycleState) -> bool {
    use LifecycleState::*;
    matches!(
      (self, next),
      (Installing, Installed)
        | (Installed, Activating)
        | (Activating, Active)
        | (Installing | Installed | Activating | Active, Redundant)
    )
  }

  pub fn is_terminal(self) -> bool {
    self == LifecycleState::Redundant
  }
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      LifecycleState::Installing => "installing",
      LifecycleState::Installed => "installed",
      LifecycleState::Activating => "activating",
      LifecycleState::Active => "active",
      LifecycleState::Redundant => "redundant",
    };
    f.write_str(name)
  }
}
