//! Switching the current and default toolchain versions.

use log::info;

use crate::error::Result;
use crate::model::EntityId;
use crate::registry::{Flag, RegistryStore};
use crate::runtime::Runtime;

/// Moves the current (per session) and default pointers.
pub struct Activation<'s, 'a, R: Runtime> {
    store: &'s RegistryStore<'a, R>,
    session: &'s str,
}

impl<'s, 'a, R: Runtime> Activation<'s, 'a, R> {
    pub fn new(store: &'s RegistryStore<'a, R>, session: &'s str) -> Self {
        Self { store, session }
    }

    /// Make `id` the current version of this session.
    #[tracing::instrument(skip(self))]
    pub fn activate_current(&self, id: &EntityId) -> Result<()> {
        self.store.set_flag(id, Flag::Current, true, self.session)?;
        info!("{} is now current for session {}", id, self.session);
        Ok(())
    }

    /// Make `id` the machine-wide default version.
    #[tracing::instrument(skip(self))]
    pub fn activate_default(&self, id: &EntityId) -> Result<()> {
        self.store.set_flag(id, Flag::Default, true, self.session)?;
        info!("{} is now the default", id);
        Ok(())
    }

    /// Set current, and default too if asked, in one registry transaction.
    pub fn activate(&self, id: &EntityId, make_default: bool) -> Result<()> {
        self.store.transaction(|registry| {
            registry.set_flag(id, Flag::Current, true, self.session)?;
            if make_default {
                registry.set_flag(id, Flag::Default, true, self.session)?;
            }
            Ok(())
        })?;
        info!("Activated {} (default: {})", id, make_default);
        Ok(())
    }
}
