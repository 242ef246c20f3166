use chrono::NaiveDateTime;

use crate::model::{BookingId, GroupId, ResourceId, RoomId, TimeRange, UserId};

/// A referenced thing that was not there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Booking(BookingId),
    Series(BookingId),
    Room(RoomId),
    Group(GroupId),
    User(UserId),
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Booking(id) => write!(f, "booking {id}"),
            Entity::Series(id) => write!(f, "series {id}"),
            Entity::Room(id) => write!(f, "room {id}"),
            Entity::Group(id) => write!(f, "group {id}"),
            Entity::User(id) => write!(f, "user {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyRange {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    SpansMidnight {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    OutsideBookingWindow {
        start: NaiveDateTime,
        earliest: NaiveDateTime,
        latest: NaiveDateTime,
    },
    UnknownResources(Vec<ResourceId>),
    Recurrence(String),
    CancelReasonRequired,
    TooLong {
        field: &'static str,
        max: usize,
    },
    Empty(&'static str),
    /// Date arithmetic on this field left chrono's representable range.
    OutOfCalendar(&'static str),
    NotAnEvent(BookingId),
    OwnerCannotParticipate,
    AlreadyParticipating,
    NotParticipating,
    TooManyOccurrences(BookingId),
    DefaultGroupRequired(GroupId),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EmptyRange { start, end } => {
                write!(f, "date_start {start} must be before date_end {end}")
            }
            ValidationError::SpansMidnight { start, end } => {
                write!(f, "booking [{start}, {end}) must start and end on the same day")
            }
            ValidationError::OutsideBookingWindow {
                start,
                earliest,
                latest,
            } => write!(
                f,
                "date_start {start} outside booking window [{earliest}, {latest}]"
            ),
            ValidationError::UnknownResources(ids) => {
                write!(f, "needed_resources: unknown ids {ids:?}")
            }
            ValidationError::Recurrence(raw) => write!(f, "recurrence: unrecognised value {raw:?}"),
            ValidationError::CancelReasonRequired => {
                write!(f, "cancel_reason: required when rejecting")
            }
            ValidationError::TooLong { field, max } => {
                write!(f, "{field}: longer than {max}")
            }
            ValidationError::Empty(field) => write!(f, "{field}: must not be empty"),
            ValidationError::OutOfCalendar(field) => {
                write!(f, "{field}: date falls outside the supported calendar")
            }
            ValidationError::NotAnEvent(id) => write!(f, "booking {id} is not an event"),
            ValidationError::OwnerCannotParticipate => {
                write!(f, "participants: the event creator cannot participate")
            }
            ValidationError::AlreadyParticipating => write!(f, "participants: already participating"),
            ValidationError::NotParticipating => write!(f, "participants: not participating"),
            ValidationError::TooManyOccurrences(series) => {
                write!(f, "series {series}: too many occurrences in one run")
            }
            ValidationError::DefaultGroupRequired(id) => {
                write!(f, "group {id} is the default group")
            }
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// The slot is held by an approved booking.
    Conflict {
        room_id: RoomId,
        range: TimeRange,
        existing: BookingId,
    },
    Validation(ValidationError),
    NotFound(Entity),
    PermissionDenied(String),
    Store(String),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }
}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Validation(e)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Conflict {
                room_id,
                range,
                existing,
            } => write!(
                f,
                "room {room_id} is already booked for [{}, {}) by booking {existing}",
                range.start, range.end
            ),
            EngineError::Validation(e) => write!(f, "validation failed: {e}"),
            EngineError::NotFound(entity) => write!(f, "not found: {entity}"),
            EngineError::PermissionDenied(perm) => write!(f, "permission denied: {perm}"),
            EngineError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
