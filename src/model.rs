use std::collections::BTreeSet;

use chrono::{Days, NaiveDate, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::audit::ChangeSet;
use crate::recurrence::Recurrence;

pub type BookingId = i64;
pub type RoomId = i64;
pub type ResourceId = i64;
pub type GroupId = i64;
pub type UserId = Ulid;

/// Half-open range `[start, end)` of naive (timezone-stripped) timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeRange {
    /// Does not check `start < end`; inputs go through `conflict::validate_range`.
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { start, end }
    }

    pub fn is_ordered(&self) -> bool {
        self.start < self.end
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Calendar date of `start`; overlap is only evaluated between bookings sharing it.
    pub fn date(&self) -> NaiveDate {
        self.start.date()
    }

    pub fn ends_same_day(&self) -> bool {
        self.start.date() == self.end.date()
    }

    /// True if the two ranges share an instant. Spelled out as the three cases the
    /// booking rules are written in: the candidate starts inside `other`, ends inside
    /// `other`, or swallows `other` whole.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        let (start, end) = (self.start, self.end);
        let (s, e) = (other.start, other.end);
        (s <= start && start < e) || (s < end && end <= e) || (start <= s && e <= end)
    }

    pub fn contains_instant(&self, t: NaiveDateTime) -> bool {
        self.start <= t && t < self.end
    }

    /// Move start and end independently. `None` if either leaves the calendar.
    pub fn shifted(&self, start_delta: TimeDelta, end_delta: TimeDelta) -> Option<Self> {
        Some(Self {
            start: self.start.checked_add_signed(start_delta)?,
            end: self.end.checked_add_signed(end_delta)?,
        })
    }
}

/// `[00:00, next 00:00)` of a calendar day.
pub fn day_bounds(date: NaiveDate) -> TimeRange {
    let start = date.and_time(chrono::NaiveTime::MIN);
    let end = date
        .checked_add_days(Days::new(1))
        .map(|d| d.and_time(chrono::NaiveTime::MIN))
        .unwrap_or(NaiveDateTime::MAX);
    TimeRange { start, end }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    PendingModeration,
    Approved,
    Rejected,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::PendingModeration => "pending_moderation",
            BookingStatus::Approved => "approved",
            BookingStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDetails {
    pub title: String,
    pub description: String,
    pub participants: BTreeSet<UserId>,
    pub image: Option<String>,
}

/// What a booking is: a public event, or a personal coworking seat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingKind {
    Event(EventDetails),
    Coworking,
}

impl BookingKind {
    /// Prefix used for permission names (`event.edit`) and audit tables.
    pub fn label(&self) -> &'static str {
        match self {
            BookingKind::Event(_) => "event",
            BookingKind::Coworking => "coworking",
        }
    }

    pub fn object_table(&self) -> &'static str {
        match self {
            BookingKind::Event(_) => "events",
            BookingKind::Coworking => "coworkings",
        }
    }
}

/// One stored occurrence. Events and coworking reservations share this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub series_id: BookingId,
    pub room_id: RoomId,
    pub owner_id: UserId,
    pub range: TimeRange,
    pub recurrence: Recurrence,
    pub status: BookingStatus,
    pub cancel_reason: String,
    pub needed_resources: BTreeSet<ResourceId>,
    pub moderator_note: String,
    pub kind: BookingKind,
}

impl Booking {
    pub fn is_approved(&self) -> bool {
        self.status == BookingStatus::Approved
    }

    /// Recurring and approved: the only bookings the materializer extends.
    pub fn is_active_series(&self) -> bool {
        self.is_approved() && self.recurrence.is_recurring()
    }

    pub fn event(&self) -> Option<&EventDetails> {
        match &self.kind {
            BookingKind::Event(details) => Some(details),
            BookingKind::Coworking => None,
        }
    }

    /// Record every field that differs between `self` (before) and `after`.
    pub fn diff_into(&self, after: &Booking, changes: &mut ChangeSet) {
        changes.record("room_id", &self.room_id, &after.room_id);
        changes.record("date_start", &self.range.start, &after.range.start);
        changes.record("date_end", &self.range.end, &after.range.end);
        changes.record("recurrence", &self.recurrence, &after.recurrence);
        changes.record("status", &self.status, &after.status);
        changes.record("cancel_reason", &self.cancel_reason, &after.cancel_reason);
        changes.record("needed_resources", &self.needed_resources, &after.needed_resources);
        changes.record("moderator_note", &self.moderator_note, &after.moderator_note);
        if let (Some(before), Some(now)) = (self.event(), after.event()) {
            changes.record("title", &before.title, &now.title);
            changes.record("description", &before.description, &now.description);
            changes.record("participants", &before.participants, &now.participants);
            changes.record("image", &before.image, &now.image);
        }
    }
}

/// Everything needed to create a booking; id and series id are assigned on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDraft {
    pub room_id: RoomId,
    pub range: TimeRange,
    pub recurrence: Recurrence,
    pub status: BookingStatus,
    pub needed_resources: BTreeSet<ResourceId>,
    pub moderator_note: String,
    pub kind: BookingKind,
}

impl BookingDraft {
    pub fn into_booking(self, id: BookingId, series_id: BookingId, owner_id: UserId) -> Booking {
        Booking {
            id,
            series_id,
            room_id: self.room_id,
            owner_id,
            range: self.range,
            recurrence: self.recurrence,
            status: self.status,
            cancel_reason: String::new(),
            needed_resources: self.needed_resources,
            moderator_note: self.moderator_note,
            kind: self.kind,
        }
    }
}

/// Partial update. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub room_id: Option<RoomId>,
    pub range: Option<TimeRange>,
    pub recurrence: Option<Recurrence>,
    pub status: Option<BookingStatus>,
    pub cancel_reason: Option<String>,
    pub needed_resources: Option<BTreeSet<ResourceId>>,
    pub moderator_note: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub participants: Option<BTreeSet<UserId>>,
    pub image: Option<Option<String>>,
}

impl BookingPatch {
    /// Whether applying this patch to `current` changes when/where the booking happens,
    /// or approves it. Such edits must go back through overlap validation.
    pub fn touches_schedule(&self, current: &Booking) -> bool {
        self.room_id.is_some_and(|r| r != current.room_id)
            || self.range.is_some_and(|r| r != current.range)
            || self.recurrence.is_some_and(|r| r != current.recurrence)
            || (self.status == Some(BookingStatus::Approved) && !current.is_approved())
    }

    pub fn changes_status(&self, current: &Booking) -> bool {
        self.status.is_some_and(|s| s != current.status)
    }

    /// Apply every field except the time range to `target`.
    pub fn apply_fields(&self, target: &mut Booking) {
        if let Some(room_id) = self.room_id {
            target.room_id = room_id;
        }
        if let Some(recurrence) = self.recurrence {
            target.recurrence = recurrence;
        }
        if let Some(status) = self.status {
            target.status = status;
            if status != BookingStatus::Rejected {
                target.cancel_reason.clear();
            }
        }
        if let Some(reason) = &self.cancel_reason {
            target.cancel_reason = reason.clone();
        }
        if let Some(resources) = &self.needed_resources {
            target.needed_resources = resources.clone();
        }
        if let Some(note) = &self.moderator_note {
            target.moderator_note = note.clone();
        }
        if let BookingKind::Event(details) = &mut target.kind {
            if let Some(title) = &self.title {
                details.title = title.clone();
            }
            if let Some(description) = &self.description {
                details.description = description.clone();
            }
            if let Some(participants) = &self.participants {
                details.participants = participants.clone();
            }
            if let Some(image) = &self.image {
                details.image = image.clone();
            }
        }
    }

    /// The patched copy of `current`, range included.
    pub fn applied_to(&self, current: &Booking) -> Booking {
        let mut next = current.clone();
        self.apply_fields(&mut next);
        if let Some(range) = self.range {
            next.range = range;
        }
        next
    }
}

/// All bookings of one room, sorted by `range.start`.
#[derive(Debug, Clone)]
pub struct RoomSchedule {
    pub room_id: RoomId,
    pub bookings: Vec<Booking>,
}

impl RoomSchedule {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            bookings: Vec::new(),
        }
    }

    /// Insert maintaining sort order by start.
    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.range.start <= booking.range.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove(&mut self, id: BookingId) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    /// Replace a booking in place, re-sorting if its start moved.
    pub fn replace(&mut self, booking: Booking) -> Option<Booking> {
        let old = self.remove(booking.id);
        self.insert(booking);
        old
    }

    pub fn get(&self, id: BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Bookings whose start falls on `date`.
    pub fn on_day(&self, date: NaiveDate) -> &[Booking] {
        let day = day_bounds(date);
        let lo = self.bookings.partition_point(|b| b.range.start < day.start);
        let hi = self.bookings.partition_point(|b| b.range.start < day.end);
        &self.bookings[lo..hi]
    }

    /// Bookings whose start lies in `[from, to)`.
    pub fn starting_within(&self, window: &TimeRange) -> &[Booking] {
        let lo = self.bookings.partition_point(|b| b.range.start < window.start);
        let hi = self.bookings.partition_point(|b| b.range.start < window.end);
        &self.bookings[lo..hi]
    }
}

/// WAL record payload. One committed transaction is a `Vec<Change>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    BookingInserted(Booking),
    BookingUpdated(Booking),
    BookingDeleted {
        id: BookingId,
        series_id: BookingId,
        room_id: RoomId,
    },
}

impl Change {
    pub fn room_id(&self) -> RoomId {
        match self {
            Change::BookingInserted(b) | Change::BookingUpdated(b) => b.room_id,
            Change::BookingDeleted { room_id, .. } => *room_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    /// Ordered allow/deny patterns; later entries override earlier ones.
    pub permissions: Vec<String>,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub is_superuser: bool,
    pub group_id: Option<GroupId>,
}

/// A resolved caller: identity plus the permission set in effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: UserId,
    pub is_superuser: bool,
    pub group: Option<Group>,
}

impl Actor {
    pub fn new(id: UserId, is_superuser: bool, group: Option<Group>) -> Self {
        Self {
            id,
            is_superuser,
            group,
        }
    }

    pub fn superuser(id: UserId) -> Self {
        Self::new(id, true, None)
    }
}
