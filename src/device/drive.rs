use crate::error::{Result, RustVtlError};
use crate::tape::CartridgeId;
use tracing::debug;

/// A virtual tape drive. The media list remembers every cartridge the drive
/// has mounted, not just the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeDrive {
    name: String,
    loaded: Option<CartridgeId>,
    media_list: Vec<CartridgeId>,
}

impl TapeDrive {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            loaded: None,
            media_list: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loaded(&self) -> Option<CartridgeId> {
        self.loaded
    }

    pub fn media_list(&self) -> &[CartridgeId] {
        &self.media_list
    }

    /// Record a cartridge in the media list without mounting it
    pub fn remember(&mut self, cartridge: CartridgeId) {
        if !self.media_list.contains(&cartridge) {
            self.media_list.push(cartridge);
        }
    }

    pub fn load(&mut self, cartridge: CartridgeId) -> Result<()> {
        if let Some(current) = self.loaded {
            return Err(RustVtlError::device(format!(
                "drive {} already holds cartridge {}",
                self.name, current
            )));
        }
        self.loaded = Some(cartridge);
        self.remember(cartridge);
        debug!("Drive {} loaded {}", self.name, cartridge);
        Ok(())
    }

    pub fn unload(&mut self) -> Result<CartridgeId> {
        let cartridge = self.loaded.take().ok_or_else(|| {
            RustVtlError::device(format!("drive {} is empty", self.name))
        })?;
        debug!("Drive {} unloaded {}", self.name, cartridge);
        Ok(cartridge)
    }

    /// Drop a cartridge from the media history
    pub fn forget(&mut self, cartridge: CartridgeId) {
        self.media_list.retain(|&c| c != cartridge);
    }

    /// Every cartridge this drive keeps alive
    pub fn cartridges(&self) -> Vec<CartridgeId> {
        self.media_list.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_unload_keeps_history() {
        let mut drive = TapeDrive::new("drive0");
        drive.load(CartridgeId(1)).unwrap();
        assert!(drive.load(CartridgeId(2)).is_err());
        assert_eq!(drive.unload().unwrap(), CartridgeId(1));
        assert!(drive.unload().is_err());

        drive.load(CartridgeId(2)).unwrap();
        drive.unload().unwrap();
        drive.load(CartridgeId(1)).unwrap();

        assert_eq!(drive.cartridges(), vec![CartridgeId(1), CartridgeId(2)]);

        drive.forget(CartridgeId(2));
        assert_eq!(drive.media_list(), &[CartridgeId(1)]);
    }
}
