//! Password reset lifecycle
//!
//! ```text
//! new --mail--> sent --(link used)--> used
//!                   \--(ttl)--------> expired
//! ```

use crate::collaborators::Mailer;
use crate::FederationConfig;
use async_trait::async_trait;
use stator_core::{EntityRecord, Result, StateDef, StateGraph, Transition, TransitionHandler};
use std::sync::Arc;

pub const ENTITY_TYPE: &str = "password_reset";
pub const NEW: &str = "new";
pub const SENT: &str = "sent";
pub const USED: &str = "used";
pub const EXPIRED: &str = "expired";

pub struct SendResetMail {
    mailer: Arc<dyn Mailer>,
}

#[async_trait]
impl TransitionHandler for SendResetMail {
    async fn handle(&self, entity: &EntityRecord) -> anyhow::Result<Transition> {
        self.mailer.send_password_reset(entity.entity.id).await?;
        Ok(Transition::to(SENT))
    }
}

pub fn graph(mailer: Arc<dyn Mailer>, config: &FederationConfig) -> Result<StateGraph> {
    StateGraph::builder(ENTITY_TYPE)
        .handler_timeout(config.handler_timeout)
        .initial(NEW)
        .state(
            StateDef::new(NEW)
                .transitions_to([SENT])
                .handler(SendResetMail { mailer }),
        )
        .state(
            StateDef::new(SENT)
                .transitions_to([USED, EXPIRED])
                .externally_progressed()
                .timeout_after(config.password_reset_ttl, EXPIRED),
        )
        .state(StateDef::terminal(USED))
        .state(StateDef::terminal(EXPIRED).manual_to([NEW]))
        .build()
}
