use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::audit::{AuditAction, AuditEntry, AuditSink, ChangeSet};
use crate::clock::Clock;
use crate::engine::{EngineError, Entity, ValidationError};
use crate::limits::*;
use crate::model::{Actor, Group, GroupId, User, UserId};
use crate::permissions::{NEGATION, Permission, has_permission};

const GROUPS_TABLE: &str = "groups";
const USERS_TABLE: &str = "users";

/// Fields of a group that can be changed after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupPatch {
    pub name: Option<String>,
    pub permissions: Option<Vec<String>>,
}

/// Groups, users, and the default group users without one fall back to.
///
/// Every read goes to the maps directly, so a permission change is visible to
/// the very next `resolve_actor`.
pub struct Directory {
    groups: DashMap<GroupId, Group>,
    users: DashMap<UserId, User>,
    next_group_id: AtomicI64,
    /// Serializes group mutations so exactly one group stays flagged default.
    group_writes: Mutex<()>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

fn require(actor: &Actor, permission: Permission) -> Result<(), EngineError> {
    if has_permission(actor, permission.as_str()) {
        Ok(())
    } else {
        Err(EngineError::PermissionDenied(permission.as_str().to_string()))
    }
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::Empty("name"));
    }
    if name.len() > MAX_GROUP_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: "name",
            max: MAX_GROUP_NAME_LEN,
        });
    }
    Ok(())
}

fn validate_patterns(patterns: &[String]) -> Result<(), ValidationError> {
    if patterns.len() > MAX_PATTERNS_PER_GROUP {
        return Err(ValidationError::TooLong {
            field: "permissions",
            max: MAX_PATTERNS_PER_GROUP,
        });
    }
    for pattern in patterns {
        if pattern.len() > MAX_PATTERN_LEN {
            return Err(ValidationError::TooLong {
                field: "permissions",
                max: MAX_PATTERN_LEN,
            });
        }
        if pattern.trim_start_matches(NEGATION).trim().is_empty() {
            return Err(ValidationError::Empty("permissions"));
        }
    }
    Ok(())
}

impl Directory {
    pub fn new(clock: Arc<dyn Clock>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            groups: DashMap::new(),
            users: DashMap::new(),
            next_group_id: AtomicI64::new(1),
            group_writes: Mutex::new(()),
            clock,
            audit,
        }
    }

    async fn emit(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.record(entry).await {
            tracing::warn!("audit sink rejected entry: {e}");
        }
    }

    async fn emit_snapshot<T: Serialize>(
        &self,
        action: AuditAction,
        actor: &Actor,
        table: &str,
        id: impl ToString,
        object: &T,
    ) {
        let entry = AuditEntry::snapshot(action, actor.id, table, id, object, self.clock.now());
        self.emit(entry).await;
    }

    async fn emit_update(&self, actor: &Actor, table: &str, id: impl ToString, changes: ChangeSet) {
        if let Some(entry) = AuditEntry::update(actor.id, table, id, changes, self.clock.now()) {
            self.emit(entry).await;
        }
    }

    /// Create a group. The first group created becomes the default.
    pub async fn create_group(
        &self,
        actor: &Actor,
        name: &str,
        permissions: Vec<String>,
    ) -> Result<Group, EngineError> {
        require(actor, Permission::GroupCreate)?;
        validate_name(name)?;
        validate_patterns(&permissions)?;

        let writes = self.group_writes.lock().await;
        let group = Group {
            id: self.next_group_id.fetch_add(1, Ordering::SeqCst),
            name: name.to_string(),
            permissions,
            is_default: self.groups.is_empty(),
        };
        self.groups.insert(group.id, group.clone());
        drop(writes);

        info!(group = group.id, name = %group.name, default = group.is_default, "created group");
        self.emit_snapshot(AuditAction::Create, actor, GROUPS_TABLE, group.id, &group)
            .await;
        Ok(group)
    }

    pub async fn update_group(
        &self,
        actor: &Actor,
        id: GroupId,
        patch: GroupPatch,
    ) -> Result<Group, EngineError> {
        require(actor, Permission::GroupEdit)?;
        if let Some(name) = &patch.name {
            validate_name(name)?;
        }
        if let Some(permissions) = &patch.permissions {
            validate_patterns(permissions)?;
        }

        let writes = self.group_writes.lock().await;
        let mut entry = self
            .groups
            .get_mut(&id)
            .ok_or(EngineError::NotFound(Entity::Group(id)))?;
        let before = entry.clone();
        if let Some(name) = patch.name {
            entry.name = name;
        }
        if let Some(permissions) = patch.permissions {
            entry.permissions = permissions;
        }
        let after = entry.clone();
        drop(entry);
        drop(writes);

        let mut changes = ChangeSet::new();
        changes.record("name", &before.name, &after.name);
        changes.record("permissions", &before.permissions, &after.permissions);
        self.emit_update(actor, GROUPS_TABLE, id, changes).await;
        Ok(after)
    }

    /// Delete a non-default group. Its members are left with no group and
    /// fall back to the default.
    pub async fn delete_group(&self, actor: &Actor, id: GroupId) -> Result<Group, EngineError> {
        require(actor, Permission::GroupDelete)?;

        let writes = self.group_writes.lock().await;
        let group = self
            .groups
            .get(&id)
            .map(|g| g.clone())
            .ok_or(EngineError::NotFound(Entity::Group(id)))?;
        if group.is_default {
            return Err(ValidationError::DefaultGroupRequired(id).into());
        }
        self.groups.remove(&id);
        let mut released = 0usize;
        for mut user in self.users.iter_mut() {
            if user.group_id == Some(id) {
                user.group_id = None;
                released += 1;
            }
        }
        drop(writes);

        info!(group = id, released, "deleted group");
        self.emit_snapshot(AuditAction::Delete, actor, GROUPS_TABLE, id, &group)
            .await;
        Ok(group)
    }

    /// Flag `id` as the default group and clear the flag everywhere else.
    pub async fn set_default_group(&self, actor: &Actor, id: GroupId) -> Result<(), EngineError> {
        require(actor, Permission::GroupEdit)?;

        let writes = self.group_writes.lock().await;
        if !self.groups.contains_key(&id) {
            return Err(EngineError::NotFound(Entity::Group(id)));
        }
        let mut flipped = Vec::new();
        for mut group in self.groups.iter_mut() {
            let is_default = group.id == id;
            if group.is_default != is_default {
                flipped.push((group.id, group.is_default, is_default));
                group.is_default = is_default;
            }
        }
        drop(writes);

        for (group_id, before, after) in flipped {
            let mut changes = ChangeSet::new();
            changes.record("is_default", &before, &after);
            self.emit_update(actor, GROUPS_TABLE, group_id, changes).await;
        }
        Ok(())
    }

    pub fn default_group(&self) -> Option<Group> {
        self.groups
            .iter()
            .find(|g| g.is_default)
            .map(|g| g.value().clone())
    }

    pub fn get_group(&self, actor: &Actor, id: GroupId) -> Result<Group, EngineError> {
        require(actor, Permission::GroupView)?;
        self.groups
            .get(&id)
            .map(|g| g.value().clone())
            .ok_or(EngineError::NotFound(Entity::Group(id)))
    }

    pub fn list_groups(&self, actor: &Actor) -> Result<Vec<Group>, EngineError> {
        require(actor, Permission::GroupView)?;
        let mut groups: Vec<Group> = self.groups.iter().map(|g| g.value().clone()).collect();
        groups.sort_by_key(|g| g.id);
        Ok(groups)
    }

    /// Register or refresh a user as reported by the identity provider.
    pub fn upsert_user(&self, user: User) -> Result<(), EngineError> {
        if let Some(group_id) = user.group_id
            && !self.groups.contains_key(&group_id)
        {
            return Err(EngineError::NotFound(Entity::Group(group_id)));
        }
        self.users.insert(user.id, user);
        Ok(())
    }

    pub async fn assign_group(
        &self,
        actor: &Actor,
        user_id: UserId,
        group_id: Option<GroupId>,
    ) -> Result<User, EngineError> {
        require(actor, Permission::GroupEdit)?;

        let writes = self.group_writes.lock().await;
        if let Some(gid) = group_id
            && !self.groups.contains_key(&gid)
        {
            return Err(EngineError::NotFound(Entity::Group(gid)));
        }
        let mut user = self
            .users
            .get_mut(&user_id)
            .ok_or(EngineError::NotFound(Entity::User(user_id)))?;
        let before = user.group_id;
        user.group_id = group_id;
        let after = user.clone();
        drop(user);
        drop(writes);

        let mut changes = ChangeSet::new();
        changes.record("group_id", &before, &group_id);
        self.emit_update(actor, USERS_TABLE, user_id, changes).await;
        Ok(after)
    }

    /// The caller as the permission evaluator sees it: a user with no group
    /// gets the default group's patterns.
    pub fn resolve_actor(&self, user_id: UserId) -> Result<Actor, EngineError> {
        let user = self
            .users
            .get(&user_id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::NotFound(Entity::User(user_id)))?;
        let group = match user.group_id {
            Some(gid) => self.groups.get(&gid).map(|g| g.value().clone()),
            None => None,
        }
        .or_else(|| self.default_group());
        Ok(Actor::new(user.id, user.is_superuser, group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    use crate::audit::MemoryAuditLog;
    use crate::clock::ManualClock;

    fn directory() -> (Directory, Arc<MemoryAuditLog>) {
        let now = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let audit = Arc::new(MemoryAuditLog::new());
        (Directory::new(Arc::new(ManualClock::new(now)), audit.clone()), audit)
    }

    fn patterns(p: &[&str]) -> Vec<String> {
        p.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn first_group_is_default_and_backs_groupless_users() {
        let (dir, _) = directory();
        let root = Actor::superuser(Ulid::new());
        let members = dir.create_group(&root, "members", patterns(&["event.edit"])).await.unwrap();
        let staff = dir.create_group(&root, "staff", patterns(&["event.*"])).await.unwrap();
        assert!(members.is_default);
        assert!(!staff.is_default);

        let user = Ulid::new();
        dir.upsert_user(User { id: user, is_superuser: false, group_id: None }).unwrap();
        let actor = dir.resolve_actor(user).unwrap();
        assert_eq!(actor.group.map(|g| g.id), Some(members.id));
        assert!(dir.resolve_actor(Ulid::new()).is_err());
    }

    #[tokio::test]
    async fn permission_change_is_visible_immediately() {
        let (dir, audit) = directory();
        let root = Actor::superuser(Ulid::new());
        let group = dir.create_group(&root, "members", patterns(&["event.edit"])).await.unwrap();
        let user = Ulid::new();
        dir.upsert_user(User { id: user, is_superuser: false, group_id: Some(group.id) }).unwrap();
        assert!(has_permission(&dir.resolve_actor(user).unwrap(), "event.edit"));

        let patch = GroupPatch {
            permissions: Some(patterns(&["event.*", "!event.edit"])),
            ..Default::default()
        };
        dir.update_group(&root, group.id, patch).await.unwrap();
        assert!(!has_permission(&dir.resolve_actor(user).unwrap(), "event.edit"));

        let updates = audit.for_object(GROUPS_TABLE, &group.id.to_string()).await;
        let last = updates.last().unwrap();
        assert_eq!(last.action, AuditAction::Update);
        assert!(last.detail["new"].get("permissions").is_some());
        assert!(last.detail["new"].get("name").is_none());
    }

    #[tokio::test]
    async fn default_group_cannot_be_deleted_and_members_are_released() {
        let (dir, _) = directory();
        let root = Actor::superuser(Ulid::new());
        let members = dir.create_group(&root, "members", Vec::new()).await.unwrap();
        let staff = dir.create_group(&root, "staff", patterns(&["group.view"])).await.unwrap();
        let err = dir.delete_group(&root, members.id).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::DefaultGroupRequired(_))
        ));

        let user = Ulid::new();
        dir.upsert_user(User { id: user, is_superuser: false, group_id: Some(staff.id) }).unwrap();
        dir.delete_group(&root, staff.id).await.unwrap();
        let actor = dir.resolve_actor(user).unwrap();
        assert_eq!(actor.group.map(|g| g.id), Some(members.id));
    }

    #[tokio::test]
    async fn set_default_moves_the_flag() {
        let (dir, _) = directory();
        let root = Actor::superuser(Ulid::new());
        let a = dir.create_group(&root, "a", Vec::new()).await.unwrap();
        let b = dir.create_group(&root, "b", Vec::new()).await.unwrap();
        dir.set_default_group(&root, b.id).await.unwrap();
        let all = dir.list_groups(&root).unwrap();
        assert_eq!(all.iter().filter(|g| g.is_default).count(), 1);
        assert_eq!(dir.default_group().map(|g| g.id), Some(b.id));
        assert!(dir.delete_group(&root, a.id).await.is_ok());
    }

    #[tokio::test]
    async fn group_mutations_need_permissions() {
        let (dir, _) = directory();
        let root = Actor::superuser(Ulid::new());
        let viewers = dir.create_group(&root, "viewers", patterns(&["group.view"])).await.unwrap();
        let viewer = Actor::new(Ulid::new(), false, Some(viewers.clone()));
        assert!(dir.list_groups(&viewer).is_ok());
        assert!(matches!(
            dir.create_group(&viewer, "x", Vec::new()).await,
            Err(EngineError::PermissionDenied(p)) if p == "group.create"
        ));
        let nobody = Actor::new(Ulid::new(), false, None);
        assert!(dir.get_group(&nobody, viewers.id).is_err());
    }

    #[tokio::test]
    async fn rejects_bad_names_and_patterns() {
        let (dir, _) = directory();
        let root = Actor::superuser(Ulid::new());
        assert!(dir.create_group(&root, "  ", Vec::new()).await.is_err());
        assert!(dir.create_group(&root, "g", patterns(&["!"])).await.is_err());
        let long = "x".repeat(MAX_PATTERN_LEN + 1);
        assert!(dir.create_group(&root, "g", vec![long]).await.is_err());
    }
}
