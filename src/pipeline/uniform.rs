/// One named field in a shader uniform or push-constant block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformField {
    pub name: String,
    pub offset: u32,
    pub size: u32,
}

/// Field table produced by the shader compiler for one block.
///
/// Only used to size push-constant ranges and check that CPU-side structs match;
/// shader source is never inspected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniformLayout {
    fields: Vec<UniformField>,
}

impl UniformLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: &str, offset: u32, size: u32) -> Self {
        self.fields.push(UniformField {
            name: name.to_string(),
            offset,
            size,
        });
        self
    }

    pub fn field(&self, name: &str) -> Option<&UniformField> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn fields(&self) -> &[UniformField] {
        &self.fields
    }

    /// Block size in bytes, rounded up to a multiple of 4.
    pub fn size(&self) -> u32 {
        let end = self
            .fields
            .iter()
            .map(|field| field.offset + field.size)
            .max()
            .unwrap_or(0);
        end.div_ceil(4) * 4
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// `mat4 light_space` pushed by shadow passes.
    pub fn shadow_push() -> Self {
        Self::new().with_field("light_space", 0, 64)
    }

    /// Per-light block pushed by lighting passes.
    pub fn light_push() -> Self {
        Self::new()
            .with_field("position_or_direction", 0, 16)
            .with_field("color", 16, 16)
            .with_field("params", 32, 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_rounds_to_words() {
        let layout = UniformLayout::new()
            .with_field("a", 0, 16)
            .with_field("b", 16, 2);
        assert_eq!(layout.size(), 20);
        assert_eq!(UniformLayout::light_push().size(), 48);
        assert_eq!(UniformLayout::new().size(), 0);
    }

    #[test]
    fn field_lookup() {
        let layout = UniformLayout::shadow_push();
        assert_eq!(layout.field("light_space").map(|f| f.size), Some(64));
        assert!(layout.field("missing").is_none());
    }
}
