use crate::model::{Actor, BookingKind};

/// Leading marker turning a pattern into a deny rule.
pub const NEGATION: char = '!';

/// Named permissions checked by the engine and directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    EventEdit,
    EventDelete,
    EventModerate,
    CoworkingEdit,
    CoworkingDelete,
    CoworkingModerate,
    GroupCreate,
    GroupEdit,
    GroupDelete,
    GroupView,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::EventEdit => "event.edit",
            Permission::EventDelete => "event.delete",
            Permission::EventModerate => "event.moderate",
            Permission::CoworkingEdit => "coworking.edit",
            Permission::CoworkingDelete => "coworking.delete",
            Permission::CoworkingModerate => "coworking.moderate",
            Permission::GroupCreate => "group.create",
            Permission::GroupEdit => "group.edit",
            Permission::GroupDelete => "group.delete",
            Permission::GroupView => "group.view",
        }
    }

    pub fn edit(kind: &BookingKind) -> Self {
        match kind {
            BookingKind::Event(_) => Permission::EventEdit,
            BookingKind::Coworking => Permission::CoworkingEdit,
        }
    }

    pub fn delete(kind: &BookingKind) -> Self {
        match kind {
            BookingKind::Event(_) => Permission::EventDelete,
            BookingKind::Coworking => Permission::CoworkingDelete,
        }
    }

    pub fn moderate(kind: &BookingKind) -> Self {
        match kind {
            BookingKind::Event(_) => Permission::EventModerate,
            BookingKind::Coworking => Permission::CoworkingModerate,
        }
    }
}

/// Superuser wins, no group loses, otherwise the group's patterns decide.
pub fn has_permission(actor: &Actor, required: &str) -> bool {
    if actor.is_superuser {
        return true;
    }
    match &actor.group {
        Some(group) => evaluate(&group.permissions, required),
        None => false,
    }
}

/// Scan `patterns` in order; every matching pattern overwrites the running result
/// (allow sets it, `!`-prefixed deny clears it). No match at all means denied.
pub fn evaluate<S: AsRef<str>>(patterns: &[S], required: &str) -> bool {
    let mut result = false;
    for raw in patterns {
        let raw = raw.as_ref();
        let negated = raw.starts_with(NEGATION);
        let clean = raw.trim_start_matches(NEGATION);
        if pattern_matches(clean, required) {
            result = !negated;
        }
    }
    result
}

/// Glob match, or a literal prefix relation in either direction: `groups`
/// matches `groups.create`, and `groups.create` matches a check for `groups`.
pub fn pattern_matches(pattern: &str, required: &str) -> bool {
    glob_matches(pattern, required) || required.starts_with(pattern) || pattern.starts_with(required)
}

/// Whole-string glob where `*` matches any (possibly empty) substring.
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            pi += 1;
            resume = ti;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            resume += 1;
            ti = resume;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}
