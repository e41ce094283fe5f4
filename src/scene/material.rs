//! Acoustic surface materials for occlusion.

/// How a surface treats sound crossing it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioMaterial {
    /// Fraction of incident energy absorbed, in [0, 1].
    pub absorption: f32,
    /// Fraction of amplitude passed through the surface, in [0, 1].
    pub transmission: f32,
}

impl AudioMaterial {
    pub const GENERIC: Self = Self {
        absorption: 0.2,
        transmission: 0.3,
    };

    pub const CONCRETE: Self = Self {
        absorption: 0.07,
        transmission: 0.05,
    };

    pub const BRICK: Self = Self {
        absorption: 0.04,
        transmission: 0.08,
    };

    pub const GLASS: Self = Self {
        absorption: 0.03,
        transmission: 0.45,
    };

    pub const METAL: Self = Self {
        absorption: 0.07,
        transmission: 0.15,
    };

    pub const WOOD: Self = Self {
        absorption: 0.07,
        transmission: 0.25,
    };

    pub const FOLIAGE: Self = Self {
        absorption: 0.5,
        transmission: 0.8,
    };

    pub fn validate(&self) -> Result<(), &'static str> {
        if !(0.0..=1.0).contains(&self.absorption) {
            return Err("absorption must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.transmission) {
            return Err("transmission must be between 0.0 and 1.0");
        }
        Ok(())
    }
}

impl Default for AudioMaterial {
    fn default() -> Self {
        Self::GENERIC
    }
}

/// Materials addressed by the `u8` index a [`RayHit`](super::RayHit) reports.
#[derive(Debug, Clone, Default)]
pub struct MaterialTable {
    materials: Vec<AudioMaterial>,
}

impl MaterialTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in presets, in declaration order: generic, concrete, brick, glass,
    /// metal, wood, foliage.
    pub fn with_presets() -> Self {
        Self {
            materials: vec![
                AudioMaterial::GENERIC,
                AudioMaterial::CONCRETE,
                AudioMaterial::BRICK,
                AudioMaterial::GLASS,
                AudioMaterial::METAL,
                AudioMaterial::WOOD,
                AudioMaterial::FOLIAGE,
            ],
        }
    }

    /// Append a material and return its index, or `None` once all 256 indices are used.
    pub fn add(&mut self, material: AudioMaterial) -> Option<u8> {
        let index = u8::try_from(self.materials.len()).ok()?;
        self.materials.push(material);
        Some(index)
    }

    pub fn get(&self, index: u8) -> Option<&AudioMaterial> {
        self.materials.get(index as usize)
    }

    /// Material at `index`, or [`AudioMaterial::GENERIC`] for unknown indices.
    pub fn get_or_generic(&self, index: u8) -> AudioMaterial {
        self.get(index).copied().unwrap_or(AudioMaterial::GENERIC)
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }
}
