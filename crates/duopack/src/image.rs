//! Image bitmaps.

use serde::Deserialize;
use serde::Serialize;

use crate::error::CodecError;
use crate::error::Result;

/// One bitmap of an image at a given scale factor. Pixels are RGBA8.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageRep {
    pub scale_factor: f32,
    pub width: u32,
    pub height: u32,
    pub bitmap: Vec<u8>,
}

impl ImageRep {
    fn check(&self) -> Result<()> {
        let expected = (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|px| px.checked_mul(4));
        if expected != Some(self.bitmap.len()) {
            return Err(CodecError::ImageSize {
                width: self.width,
                height: self.height,
                found: self.bitmap.len(),
            });
        }
        Ok(())
    }
}

/// An image made of one or more representations.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Image {
    reps: Vec<ImageRep>,
}

impl Image {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single-representation image at scale factor 1.
    pub fn from_rgba(width: u32, height: u32, bitmap: Vec<u8>) -> Result<Self> {
        let mut image = Self::new();
        image.add_representation(ImageRep { scale_factor: 1.0, width, height, bitmap })?;
        Ok(image)
    }

    /// Validates and collects a list of representations.
    pub fn from_representations(reps: Vec<ImageRep>) -> Result<Self> {
        for rep in &reps {
            rep.check()?;
        }
        Ok(Self { reps })
    }

    pub fn add_representation(&mut self, rep: ImageRep) -> Result<()> {
        rep.check()?;
        self.reps.push(rep);
        Ok(())
    }

    pub fn representations(&self) -> &[ImageRep] {
        &self.reps
    }

    pub fn is_empty(&self) -> bool {
        self.reps.is_empty()
    }

    /// Size of the scale-1 representation, or of the first one.
    pub fn size(&self) -> Option<(u32, u32)> {
        self.reps
            .iter()
            .find(|r| r.scale_factor == 1.0)
            .or_else(|| self.reps.first())
            .map(|r| (r.width, r.height))
    }
}
