//! Idena client flows built on `idn-workflow`.
//!
//! Each module exposes a `definition(&FlowDeps)` returning a machine builder
//! with its effects registered, and the context type the machine runs with.

pub mod ad;
pub mod api_key;
pub mod deps;
pub mod draft;
pub mod error;
pub mod flip;
pub mod invite;
pub mod mining;
pub mod watch;

pub use ad::{Ad, AdContext};
pub use api_key::ApiKeyContext;
pub use deps::FlowDeps;
pub use draft::{AdStatus, Draft, DraftError, Drafts, FlipStatus, Lifecycle};
pub use error::{FlowError, FlowResult};
pub use flip::{FlipContext, FlipDraft};
pub use invite::InviteContext;
pub use mining::{MiningContext, MiningMode};
pub use watch::{MINED, MINING_FAILED, TIMEOUT, TX_NULL, WaitForMining, mining_state};

use idn_workflow::{DefinitionResult, MachineBuilder, MachineContext, OutlineEntry};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// The flows shipped with this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    Flip,
    Ad,
    Mining,
    Invite,
    ApiKey,
}

impl FlowKind {
    pub const ALL: [FlowKind; 5] = [
        FlowKind::Flip,
        FlowKind::Ad,
        FlowKind::Mining,
        FlowKind::Invite,
        FlowKind::ApiKey,
    ];

    /// Machine id of the flow
    pub fn name(self) -> &'static str {
        match self {
            FlowKind::Flip => flip::MACHINE_ID,
            FlowKind::Ad => ad::MACHINE_ID,
            FlowKind::Mining => mining::MACHINE_ID,
            FlowKind::Invite => invite::MACHINE_ID,
            FlowKind::ApiKey => api_key::MACHINE_ID,
        }
    }

    /// Build the flow's definition against `deps` and describe it
    pub fn outline(self, deps: &FlowDeps) -> DefinitionResult<FlowOutline> {
        match self {
            FlowKind::Flip => FlowOutline::of(flip::definition(deps)),
            FlowKind::Ad => FlowOutline::of(ad::definition(deps)),
            FlowKind::Mining => FlowOutline::of(mining::definition(deps)),
            FlowKind::Invite => FlowOutline::of(invite::definition(deps)),
            FlowKind::ApiKey => FlowOutline::of(api_key::definition(deps)),
        }
    }
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FlowKind {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "flip" => Ok(FlowKind::Flip),
            "ad" | "ads" | "adlist" => Ok(FlowKind::Ad),
            "mining" => Ok(FlowKind::Mining),
            "invite" => Ok(FlowKind::Invite),
            "apikey" => Ok(FlowKind::ApiKey),
            _ => Err(FlowError::InvalidInput(format!("unknown flow '{}'", s))),
        }
    }
}

/// Static description of a validated flow definition
#[derive(Debug, Clone, Serialize)]
pub struct FlowOutline {
    pub id: String,
    pub states: Vec<OutlineEntry>,
    pub leaves: Vec<String>,
    pub events: Vec<String>,
}

impl FlowOutline {
    pub fn of<C: MachineContext>(definition: MachineBuilder<C>) -> DefinitionResult<Self> {
        let machine = definition.build()?;
        Ok(Self {
            id: machine.id().to_string(),
            states: machine.outline(),
            leaves: machine.leaf_states().iter().map(ToString::to_string).collect(),
            events: machine.events(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idn_adapters::SimNode;
    use std::sync::Arc;

    #[test]
    fn parses_flow_names() {
        assert_eq!("adList".parse::<FlowKind>().unwrap(), FlowKind::Ad);
        assert_eq!("api-key".parse::<FlowKind>().unwrap(), FlowKind::ApiKey);
        assert_eq!("Flip".parse::<FlowKind>().unwrap(), FlowKind::Flip);
        assert!("wallet".parse::<FlowKind>().is_err());
    }

    #[test]
    fn every_flow_definition_is_valid() {
        let deps = FlowDeps::in_memory(Arc::new(SimNode::new()));
        for kind in FlowKind::ALL {
            let outline = kind.outline(&deps).unwrap();
            assert_eq!(outline.id, kind.name());
            assert!(!outline.leaves.is_empty());
        }

        let flip = FlowKind::Flip.outline(&deps).unwrap();
        assert!(flip.leaves.contains(&"keywords.loaded.fetchTranslationsFailed".to_string()));
        assert!(flip.leaves.contains(&"submit.success".to_string()));

        let ads = FlowKind::Ad.outline(&deps).unwrap();
        for leaf in [
            "ready.sendToReview.mineDeployVoting",
            "ready.sendToReview.mineStartVoting",
            "ready.publish.mining",
            "ready.removeAd.confirm",
        ] {
            assert!(ads.leaves.contains(&leaf.to_string()), "missing {}", leaf);
        }
    }
}
