//! Shared scratch buffer for a sequence of layers
//!
//! Every layer reports its scratch need in bytes through
//! `Layer::workspace_size`. The owning graph allocates one `Workspace` sized to
//! the largest of those and lends it to each forward/backward call in turn.

use crate::layers::Layer;

/// Caller-owned scratch memory, stored as `f32` words.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    buffer: Vec<f32>,
}

impl Workspace {
    /// Allocate at least `bytes` bytes of zeroed scratch.
    pub fn with_bytes(bytes: usize) -> Self {
        Self {
            buffer: vec![0.0f32; words(bytes)],
        }
    }

    /// Allocate scratch large enough for every layer in `layers`.
    pub fn for_layers<'a, I>(layers: I) -> Self
    where
        I: IntoIterator<Item = &'a dyn Layer>,
    {
        let bytes = layers
            .into_iter()
            .map(|layer| layer.workspace_size())
            .max()
            .unwrap_or(0);
        tracing::debug!(bytes, "allocated shared workspace");
        Self::with_bytes(bytes)
    }

    /// Grow the buffer so it holds at least `bytes` bytes. Never shrinks.
    ///
    /// Call after resizing a layer, whose workspace need may have grown.
    pub fn ensure_bytes(&mut self, bytes: usize) {
        let needed = words(bytes);
        if needed > self.buffer.len() {
            tracing::debug!(from = self.size_bytes(), to = bytes, "growing shared workspace");
            self.buffer.resize(needed, 0.0);
        }
    }

    pub fn size_bytes(&self) -> usize {
        std::mem::size_of_val(self.buffer.as_slice())
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.buffer
    }
}

fn words(bytes: usize) -> usize {
    bytes.div_ceil(std::mem::size_of::<f32>())
}
