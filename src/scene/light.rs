use glam::Vec3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightKind {
    /// Infinitely distant light travelling along `direction`.
    Directional { direction: Vec3 },
    Point { position: Vec3, range: f32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Light {
    pub kind: LightKind,
    pub color: Vec3,
    pub intensity: f32,
    pub casts_shadows: bool,
}

impl Light {
    pub fn directional(direction: Vec3) -> Self {
        Self {
            kind: LightKind::Directional {
                direction: direction.normalize_or(Vec3::NEG_Y),
            },
            color: Vec3::ONE,
            intensity: 1.0,
            casts_shadows: true,
        }
    }

    pub fn point(position: Vec3, range: f32) -> Self {
        Self {
            kind: LightKind::Point { position, range },
            color: Vec3::ONE,
            intensity: 1.0,
            casts_shadows: true,
        }
    }

    pub fn with_shadows(mut self, casts_shadows: bool) -> Self {
        self.casts_shadows = casts_shadows;
        self
    }

    pub fn with_color(mut self, color: Vec3, intensity: f32) -> Self {
        self.color = color;
        self.intensity = intensity;
        self
    }

    pub fn is_directional(&self) -> bool {
        matches!(self.kind, LightKind::Directional { .. })
    }

    /// Direction shadows are cast along, for directional lights.
    pub fn shadow_direction(&self) -> Option<Vec3> {
        match self.kind {
            LightKind::Directional { direction } => Some(direction),
            LightKind::Point { .. } => None,
        }
    }
}
