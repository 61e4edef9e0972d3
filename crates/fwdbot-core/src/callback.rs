//! Typed callback payloads.
//!
//! Payloads are `namespace:action[:arg]*` strings. They are parsed once
//! at the dispatch boundary into [`CallbackAction`]; handlers never see
//! raw strings, and unknown or malformed payloads are rejected at the
//! edge with an error toast.

use std::str::FromStr;

use uuid::Uuid;

use crate::errors::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    /// `manage:menu` — re-render the superuser menu.
    ManageMenu,
    /// `manage:all_bots`
    ManageAllBots,
    /// `manage:all_managers`
    ManageAllManagers,
    /// `bot:view:<uuid>`
    BotView(Uuid),
    /// `bot:delete:<uuid>` — opens the confirmation step.
    BotDelete(Uuid),
    /// `manager:view:<uuid>`
    ManagerView(Uuid),
    /// `delete_bot:yes:<uuid>` — second step, executes the deletion.
    DeleteBotConfirmed(Uuid),
    /// `delete_bot:no:<uuid>`
    DeleteBotCancelled(Uuid),
    /// `mybots:list`
    MyBotsList,
    /// `blacklist:approve:<uuid>` / `blacklist:reject:<uuid>`
    BlacklistDecision { entry_id: Uuid, approve: bool },
    /// `blacklist:status:<uuid>` — inert button on decided prompts.
    BlacklistStatus(Uuid),
}

impl FromStr for CallbackAction {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = raw.split(':').collect();
        let malformed = || Error::Validation(format!("invalid callback data: {raw}"));

        let parse_id = |idx: usize| -> Result<Uuid, Error> {
            parts
                .get(idx)
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(malformed)
        };

        match (parts.first().copied(), parts.get(1).copied()) {
            (Some("manage"), Some("menu")) if parts.len() == 2 => Ok(CallbackAction::ManageMenu),
            (Some("manage"), Some("all_bots")) if parts.len() == 2 => {
                Ok(CallbackAction::ManageAllBots)
            }
            (Some("manage"), Some("all_managers")) if parts.len() == 2 => {
                Ok(CallbackAction::ManageAllManagers)
            }
            (Some("bot"), Some("view")) if parts.len() == 3 => {
                Ok(CallbackAction::BotView(parse_id(2)?))
            }
            (Some("bot"), Some("delete")) if parts.len() == 3 => {
                Ok(CallbackAction::BotDelete(parse_id(2)?))
            }
            (Some("manager"), Some("view")) if parts.len() == 3 => {
                Ok(CallbackAction::ManagerView(parse_id(2)?))
            }
            (Some("delete_bot"), Some("yes")) if parts.len() == 3 => {
                Ok(CallbackAction::DeleteBotConfirmed(parse_id(2)?))
            }
            (Some("delete_bot"), Some("no")) if parts.len() == 3 => {
                Ok(CallbackAction::DeleteBotCancelled(parse_id(2)?))
            }
            (Some("mybots"), Some("list")) if parts.len() == 2 => Ok(CallbackAction::MyBotsList),
            (Some("blacklist"), Some("approve")) if parts.len() == 3 => {
                Ok(CallbackAction::BlacklistDecision {
                    entry_id: parse_id(2)?,
                    approve: true,
                })
            }
            (Some("blacklist"), Some("reject")) if parts.len() == 3 => {
                Ok(CallbackAction::BlacklistDecision {
                    entry_id: parse_id(2)?,
                    approve: false,
                })
            }
            (Some("blacklist"), Some("status")) if parts.len() == 3 => {
                Ok(CallbackAction::BlacklistStatus(parse_id(2)?))
            }
            _ => Err(malformed()),
        }
    }
}

impl CallbackAction {
    /// Renders the action back into its wire payload.
    pub fn encode(&self) -> String {
        match self {
            CallbackAction::ManageMenu => "manage:menu".to_string(),
            CallbackAction::ManageAllBots => "manage:all_bots".to_string(),
            CallbackAction::ManageAllManagers => "manage:all_managers".to_string(),
            CallbackAction::BotView(id) => format!("bot:view:{id}"),
            CallbackAction::BotDelete(id) => format!("bot:delete:{id}"),
            CallbackAction::ManagerView(id) => format!("manager:view:{id}"),
            CallbackAction::DeleteBotConfirmed(id) => format!("delete_bot:yes:{id}"),
            CallbackAction::DeleteBotCancelled(id) => format!("delete_bot:no:{id}"),
            CallbackAction::MyBotsList => "mybots:list".to_string(),
            CallbackAction::BlacklistDecision { entry_id, approve } => {
                let verb = if *approve { "approve" } else { "reject" };
                format!("blacklist:{verb}:{entry_id}")
            }
            CallbackAction::BlacklistStatus(id) => format!("blacklist:status:{id}"),
        }
    }
}
