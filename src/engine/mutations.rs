use std::collections::BTreeSet;

use tracing::info;

use crate::audit::{AuditAction, AuditEntry, ChangeSet};
use crate::limits::*;
use crate::model::*;
use crate::permissions::{Permission, has_permission};

use super::conflict::{validate_range, validate_window};
use super::series::schedule_series;
use super::txn::Txn;
use super::{Engine, EngineError, Entity, ValidationError};

fn deny(permission: Permission) -> EngineError {
    EngineError::PermissionDenied(permission.as_str().to_string())
}

/// Moderators may edit anything; owners may edit their own bookings with the
/// kind's edit permission. Status changes are moderator-only.
pub(super) fn authorize_edit(
    actor: &Actor,
    current: &Booking,
    patch: &BookingPatch,
) -> Result<(), EngineError> {
    let moderate = Permission::moderate(&current.kind);
    if has_permission(actor, moderate.as_str()) {
        return Ok(());
    }
    if patch.changes_status(current) {
        return Err(deny(moderate));
    }
    let edit = Permission::edit(&current.kind);
    if current.owner_id == actor.id && has_permission(actor, edit.as_str()) {
        Ok(())
    } else {
        Err(deny(edit))
    }
}

fn authorize_delete(actor: &Actor, current: &Booking) -> Result<(), EngineError> {
    if has_permission(actor, Permission::moderate(&current.kind).as_str()) {
        return Ok(());
    }
    let delete = Permission::delete(&current.kind);
    if current.owner_id == actor.id && has_permission(actor, delete.as_str()) {
        Ok(())
    } else {
        Err(deny(delete))
    }
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.len() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}

/// Size limits plus the rejection rule: a rejected booking carries a reason.
pub(super) fn validate_fields(b: &Booking) -> Result<(), ValidationError> {
    check_len("cancel_reason", &b.cancel_reason, MAX_TEXT_LEN)?;
    check_len("moderator_note", &b.moderator_note, MAX_TEXT_LEN)?;
    if b.needed_resources.len() > MAX_NEEDED_RESOURCES {
        return Err(ValidationError::TooLong {
            field: "needed_resources",
            max: MAX_NEEDED_RESOURCES,
        });
    }
    if let Some(event) = b.event() {
        if event.title.trim().is_empty() {
            return Err(ValidationError::Empty("title"));
        }
        check_len("title", &event.title, MAX_TITLE_LEN)?;
        check_len("description", &event.description, MAX_TEXT_LEN)?;
        if event.participants.len() > MAX_PARTICIPANTS {
            return Err(ValidationError::TooLong {
                field: "participants",
                max: MAX_PARTICIPANTS,
            });
        }
    }
    if b.status == BookingStatus::Rejected && b.cancel_reason.trim().is_empty() {
        return Err(ValidationError::CancelReasonRequired);
    }
    Ok(())
}

impl Engine {
    /// Create a booking, plus its occurrences up to the horizon when it is an
    /// approved recurring one. Asking for any status other than pending needs
    /// the kind's moderate permission.
    pub async fn create_booking(
        &self,
        actor: &Actor,
        draft: BookingDraft,
    ) -> Result<Booking, EngineError> {
        let now = self.clock.now();
        validate_range(&draft.range)?;
        validate_window(&draft.range, now, &self.rules)?;
        if draft.status != BookingStatus::PendingModeration {
            let moderate = Permission::moderate(&draft.kind);
            if !has_permission(actor, moderate.as_str()) {
                return Err(deny(moderate));
            }
        }
        if !self.catalog.room_exists(draft.room_id).await {
            return Err(EngineError::NotFound(Entity::Room(draft.room_id)));
        }
        self.check_resources(&draft.needed_resources).await?;

        let horizon = self.horizon_end(now)?;
        let id = self.allocate_id();
        let booking = draft.into_booking(id, id, actor.id);
        let mut txn = Txn::begin(self, [booking.room_id]).await;
        let occurrences = schedule_series(&mut txn, booking.clone(), horizon)?;
        txn.commit().await?;

        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL,
            "kind" => booking.kind.label())
        .increment(1);
        if occurrences > 0 {
            metrics::counter!(crate::observability::OCCURRENCES_MATERIALIZED_TOTAL)
                .increment(occurrences as u64);
        }
        info!(
            id,
            room = booking.room_id,
            kind = booking.kind.label(),
            status = booking.status.as_str(),
            occurrences,
            "created booking"
        );
        self.emit_audit(AuditEntry::snapshot(
            AuditAction::Create,
            actor.id,
            booking.kind.object_table(),
            id,
            &booking,
            now,
        ))
        .await;
        Ok(booking)
    }

    /// Remove a single row. Other rows of its series stay.
    pub async fn delete_booking(&self, actor: &Actor, id: BookingId) -> Result<Booking, EngineError> {
        let (mut txn, current) = self.lock_booking(id, None).await?;
        authorize_delete(actor, &current)?;
        txn.delete(&current)?;
        txn.commit().await?;

        info!(id, room = current.room_id, "deleted booking");
        self.emit_audit(AuditEntry::snapshot(
            AuditAction::Delete,
            actor.id,
            current.kind.object_table(),
            id,
            &current,
            self.clock.now(),
        ))
        .await;
        Ok(current)
    }

    pub async fn participate(&self, actor: &Actor, event_id: BookingId) -> Result<Booking, EngineError> {
        self.change_participation(actor, event_id, true).await
    }

    pub async fn unparticipate(
        &self,
        actor: &Actor,
        event_id: BookingId,
    ) -> Result<Booking, EngineError> {
        self.change_participation(actor, event_id, false).await
    }

    async fn change_participation(
        &self,
        actor: &Actor,
        id: BookingId,
        join: bool,
    ) -> Result<Booking, EngineError> {
        let (mut txn, current) = self.lock_booking(id, None).await?;
        let mut next = current.clone();
        let BookingKind::Event(details) = &mut next.kind else {
            return Err(ValidationError::NotAnEvent(id).into());
        };
        if join {
            if current.owner_id == actor.id {
                return Err(ValidationError::OwnerCannotParticipate.into());
            }
            if details.participants.contains(&actor.id) {
                return Err(ValidationError::AlreadyParticipating.into());
            }
            if details.participants.len() >= MAX_PARTICIPANTS {
                return Err(ValidationError::TooLong {
                    field: "participants",
                    max: MAX_PARTICIPANTS,
                }
                .into());
            }
            details.participants.insert(actor.id);
        } else if !details.participants.remove(&actor.id) {
            return Err(ValidationError::NotParticipating.into());
        }

        txn.update(current.room_id, next.clone())?;
        txn.commit().await?;
        self.audit_update(actor, &current, &next).await;
        Ok(next)
    }

    /// `UnknownResources` listing every id the catalog doesn't know.
    pub(super) async fn check_resources(
        &self,
        resources: &BTreeSet<ResourceId>,
    ) -> Result<(), EngineError> {
        if resources.is_empty() {
            return Ok(());
        }
        let ids: Vec<ResourceId> = resources.iter().copied().collect();
        let missing = self.catalog.missing_resources(&ids).await;
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::UnknownResources(missing).into())
        }
    }

    /// Lock the room holding `id` (and `extra`), returning the booking as seen
    /// under the lock.
    pub(super) async fn lock_booking(
        &self,
        id: BookingId,
        extra: Option<RoomId>,
    ) -> Result<(Txn<'_>, Booking), EngineError> {
        loop {
            let room_id = self
                .room_of(id)
                .ok_or(EngineError::NotFound(Entity::Booking(id)))?;
            let txn = Txn::begin(self, std::iter::once(room_id).chain(extra)).await;
            if let Some(current) = txn.get(id).cloned() {
                return Ok((txn, current));
            }
            // Moved or deleted between the index read and the lock.
        }
    }

    pub(super) async fn audit_update(&self, actor: &Actor, before: &Booking, after: &Booking) {
        let mut changes = ChangeSet::new();
        before.diff_into(after, &mut changes);
        if let Some(entry) = AuditEntry::update(
            actor.id,
            before.kind.object_table(),
            before.id,
            changes,
            self.clock.now(),
        ) {
            self.emit_audit(entry).await;
        }
    }
}
