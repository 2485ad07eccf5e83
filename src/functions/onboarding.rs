use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::function::{Approvable, Function, Invocation};
use crate::model::{Chat, User};
use crate::store::PendingUser;

pub const START: &str = "start";
pub const APPROVE_USER: &str = "approve_user";

const APPROVE: &str = "Approve";
const POSTPONE: &str = "Postpone";
const BAN: &str = "Ban";

/// Onboarding for unknown users: files a pending request for the app.
/// Sets `first_send` when a new request was created.
pub struct Start;

#[async_trait]
impl Function for Start {
    fn name(&self) -> &'static str {
        START
    }

    fn settings_keys(&self) -> &'static [&'static str] {
        &["app", "first_send"]
    }

    async fn run(&self, inv: &mut Invocation<'_>) -> Result<()> {
        inv.set("first_send", false)?;
        let app: String = inv.get("app")?;
        let user = inv.user().clone();

        let pending = inv.store().list_pending_users(&app).await?;
        match pending.iter().find(|p| p.user_id == user.id) {
            Some(request) if request.banned => {}
            Some(_) => {
                inv.send("Application has been already sent. Please wait for approval from admin");
            }
            None => {
                inv.store()
                    .insert_pending_user(&PendingUser {
                        user_id: user.id,
                        app: app.clone(),
                        name: user.name.clone(),
                        username: user.username.clone(),
                        approved: false,
                        banned: false,
                    })
                    .await?;
                info!("New {} application from user {}", app, user.id);
                inv.set("first_send", true)?;
                inv.send("Application sent!");
            }
        }

        inv.close();
        Ok(())
    }
}

/// Runs in the admin chat: asks the admin to approve, postpone or ban
/// an onboarding request.
pub struct ApproveUser {
    approver: Arc<dyn Approvable>,
}

impl ApproveUser {
    pub fn new(approver: Arc<dyn Approvable>) -> Self {
        Self { approver }
    }

    fn request_text(app: &str, user: &User) -> String {
        format!("app {} - new user request from:\n\n{}", app, user.describe())
    }
}

#[async_trait]
impl Function for ApproveUser {
    fn name(&self) -> &'static str {
        APPROVE_USER
    }

    fn settings_keys(&self) -> &'static [&'static str] {
        &["new_user", "new_chat", "app"]
    }

    async fn run(&self, inv: &mut Invocation<'_>) -> Result<()> {
        let new_user: User = inv.get("new_user")?;
        let app: String = inv.get("app")?;
        let text = Self::request_text(&app, &new_user);

        match inv.state() {
            1 => {
                inv.send_keyboard(
                    text,
                    vec![vec![
                        APPROVE.to_string(),
                        POSTPONE.to_string(),
                        BAN.to_string(),
                    ]],
                );
                inv.next();
            }
            _ => {
                let choice = inv.input().unwrap_or_default().to_string();
                match choice.as_str() {
                    APPROVE => {
                        let new_chat: Chat = inv.get("new_chat")?;
                        self.approver
                            .approve(inv.store(), &new_user, &new_chat, &app)
                            .await?;
                        info!("User {} approved for {}", new_user.id, app);
                        inv.answer("Approved");
                        inv.edit(format!("{}\n\nApproved", text), None);
                        inv.send_to(
                            new_user.id,
                            "Your application has been approved\n\nWhat can I do with this app? /help",
                        );
                        inv.refresh_users();
                    }
                    POSTPONE => {
                        inv.answer("Postponed");
                        inv.edit(format!("{}\n\nPostponed", text), None);
                    }
                    BAN => {
                        self.approver.ban(inv.store(), &new_user, &app).await?;
                        info!("User {} banned from {}", new_user.id, app);
                        inv.answer("Banned");
                        inv.edit(format!("{}\n\nBanned", text), None);
                    }
                    _ => {
                        inv.answer("Invalid choice");
                        inv.same();
                        return Ok(());
                    }
                }
                inv.close();
            }
        }
        Ok(())
    }
}
