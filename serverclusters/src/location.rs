/// A point in some world on some backend server.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationInfo {
    server: String,
    world: String,
    x: f64,
    y: f64,
    z: f64,
    yaw: f32,
    pitch: f32,
}

impl LocationInfo {
    /// Location facing yaw 0, pitch 0.
    pub fn new(
        server: impl Into<String>,
        world: impl Into<String>,
        x: f64,
        y: f64,
        z: f64,
    ) -> Self {
        Self::with_rotation(server, world, x, y, z, 0.0, 0.0)
    }

    pub fn with_rotation(
        server: impl Into<String>,
        world: impl Into<String>,
        x: f64,
        y: f64,
        z: f64,
        yaw: f32,
        pitch: f32,
    ) -> Self {
        Self {
            server: server.into(),
            world: world.into(),
            x,
            y,
            z,
            yaw,
            pitch,
        }
    }

    /// The same coordinates on another server.
    pub fn with_server(&self, server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..self.clone()
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn world(&self) -> &str {
        &self.world
    }

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn y(&self) -> f64 {
        self.y
    }

    pub fn z(&self) -> f64 {
        self.z
    }

    pub fn yaw(&self) -> f32 {
        self.yaw
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }
}

/// A named teleport destination owned by a cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct WarpInfo {
    name: String,
    permission: String,
    location: LocationInfo,
}

impl WarpInfo {
    /// Warp guarded by the default `serverclusters.warp.<name>` permission.
    pub fn new(name: impl Into<String>, location: LocationInfo) -> Self {
        let name = name.into();
        let permission = format!("serverclusters.warp.{}", name.to_lowercase());
        Self::with_permission(name, permission, location)
    }

    pub fn with_permission(
        name: impl Into<String>,
        permission: impl Into<String>,
        location: LocationInfo,
    ) -> Self {
        Self {
            name: name.into(),
            permission: permission.into(),
            location,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lower-cased name, the key warps are stored under.
    pub fn key(&self) -> String {
        self.name.to_lowercase()
    }

    pub fn permission(&self) -> &str {
        &self.permission
    }

    pub fn location(&self) -> &LocationInfo {
        &self.location
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_location_has_no_rotation() {
        let loc = LocationInfo::new("s1", "world", 1.5, 64.0, -3.25);
        assert_eq!(loc.server(), "s1");
        assert_eq!(loc.world(), "world");
        assert_eq!((loc.x(), loc.y(), loc.z()), (1.5, 64.0, -3.25));
        assert_eq!(loc.yaw(), 0.0);
        assert_eq!(loc.pitch(), 0.0);
    }

    #[test]
    fn test_with_server_keeps_coordinates() {
        let loc = LocationInfo::with_rotation("s1", "world_nether", 1.0, 2.0, 3.0, 90.0, -45.0);
        let moved = loc.with_server("s2");
        assert_eq!(moved.server(), "s2");
        assert_eq!(moved.world(), "world_nether");
        assert_eq!(moved.yaw(), 90.0);
        assert_eq!(moved.pitch(), -45.0);
    }

    #[test]
    fn test_warp_default_permission() {
        let warp = WarpInfo::new("Market", LocationInfo::new("s1", "world", 0.0, 70.0, 0.0));
        assert_eq!(warp.name(), "Market");
        assert_eq!(warp.key(), "market");
        assert_eq!(warp.permission(), "serverclusters.warp.market");
    }
}
