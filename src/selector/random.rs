//! Random selector implementation

use rand::Rng;

use crate::address::AddressModel;
use crate::command::SelectorMode;
use crate::{Result, SurgeError};
use super::{AddressSelector, SelectContext};

/// Random selector - uniform pick over the candidates
#[derive(Debug, Default)]
pub struct Random;

impl Random {
    pub fn new() -> Self {
        Self
    }
}

impl AddressSelector for Random {
    fn select(&self, ctx: &SelectContext<'_>) -> Result<AddressModel> {
        if ctx.candidates.is_empty() {
            return Err(SurgeError::NoAvailableAddress(ctx.service_id.to_string()));
        }

        let idx = rand::thread_rng().gen_range(0..ctx.candidates.len());
        Ok(ctx.candidates[idx].clone())
    }

    fn mode(&self) -> SelectorMode {
        SelectorMode::Random
    }
}
