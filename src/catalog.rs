use async_trait::async_trait;
use dashmap::DashSet;

use crate::model::{ResourceId, RoomId};

/// Existence checks for rooms and bookable resources owned by the surrounding service.
#[async_trait]
pub trait ResourceCatalog: Send + Sync {
    async fn room_exists(&self, room_id: RoomId) -> bool;

    /// Ids from `ids` that do not exist, in input order. Empty when all exist.
    async fn missing_resources(&self, ids: &[ResourceId]) -> Vec<ResourceId>;
}

/// Catalog held in memory; rooms and resources are registered up front.
#[derive(Default)]
pub struct StaticCatalog {
    rooms: DashSet<RoomId>,
    resources: DashSet<ResourceId>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rooms(rooms: impl IntoIterator<Item = RoomId>) -> Self {
        let catalog = Self::new();
        for room in rooms {
            catalog.add_room(room);
        }
        catalog
    }

    pub fn add_room(&self, room_id: RoomId) {
        self.rooms.insert(room_id);
    }

    pub fn add_resource(&self, resource_id: ResourceId) {
        self.resources.insert(resource_id);
    }
}

#[async_trait]
impl ResourceCatalog for StaticCatalog {
    async fn room_exists(&self, room_id: RoomId) -> bool {
        self.rooms.contains(&room_id)
    }

    async fn missing_resources(&self, ids: &[ResourceId]) -> Vec<ResourceId> {
        ids.iter()
            .copied()
            .filter(|id| !self.resources.contains(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_missing_resources_in_order() {
        let catalog = StaticCatalog::with_rooms([7]);
        catalog.add_resource(1);
        catalog.add_resource(3);
        assert!(catalog.room_exists(7).await);
        assert!(!catalog.room_exists(8).await);
        assert_eq!(catalog.missing_resources(&[4, 1, 2, 3]).await, vec![4, 2]);
        assert!(catalog.missing_resources(&[]).await.is_empty());
    }

    #[test]
    fn rooms_added_after_construction_are_visible() {
        let catalog = StaticCatalog::new();
        assert!(!tokio_test::block_on(catalog.room_exists(3)));
        catalog.add_room(3);
        assert!(tokio_test::block_on(catalog.room_exists(3)));
    }
}
