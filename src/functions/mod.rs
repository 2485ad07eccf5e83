pub mod onboarding;
pub mod system;

use std::sync::Arc;

use crate::commands::Command;
use crate::function::Approvable;

pub use onboarding::{ApproveUser, Start, APPROVE_USER, START};
pub use system::{Cancel, ExpiredCallback, Help, Status, EXPIRED_CALLBACK};

/// Commands every application gets. The onboarding alias comes from config,
/// `approver` decides what approving a user means for the application.
pub fn builtin_commands(
    onboarding_keyword: &str,
    marker: &str,
    approver: Arc<dyn Approvable>,
) -> Vec<Command> {
    vec![
        Command::new(&[onboarding_keyword], Start),
        Command::new(&["help"], Help::new(marker)),
        Command::new(&["cancel", "reset"], Cancel),
        Command::new(&["status"], Status).admin(),
        Command::internal(ApproveUser::new(approver)).admin(),
        Command::internal(ExpiredCallback),
    ]
}
