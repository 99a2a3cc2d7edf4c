// Protocol version negotiation.
//
// Clients offer a list of semver ranges in `connect_document`. The server
// walks the offered ranges in the client's order and, for each, its own
// supported ranges newest first; the first server range that intersects
// the offered range is selected. The selection is intentionally sensitive
// to the client's ordering: older drivers rely on it.

use semver::{Comparator, Op, Version, VersionReq};
use std::cmp::Ordering;
use std::fmt;

/// All protocol ranges the server speaks, newest first.
const SUPPORTED_VERSIONS: &[&str] = &["^0.4.0", "^0.3.0", "^0.2.0", "^0.1.0"];

/// Assumed when a client offers no versions at all.
const DEFAULT_CLIENT_VERSIONS: &[&str] = &["^0.1.0"];

/// Clients offering this range understand room join/leave signals.
const ROOM_SIGNAL_VERSION: &str = "^0.3.0";

/// Returns the list of supported protocol ranges (newest first).
pub fn supported_versions() -> &'static [&'static str] {
    SUPPORTED_VERSIONS
}

pub fn supported_versions_owned() -> Vec<String> {
    SUPPORTED_VERSIONS.iter().map(|version| version.to_string()).collect()
}

/// Returns the ranges the client offered, or the legacy default.
pub fn offered_or_default(offered: Option<&[String]>) -> Vec<String> {
    match offered {
        Some(versions) if !versions.is_empty() => versions.to_vec(),
        _ => DEFAULT_CLIENT_VERSIONS.iter().map(|version| version.to_string()).collect(),
    }
}

/// Whether join/leave signals may be sent to a client with these ranges.
pub fn supports_room_signals(offered: &[String]) -> bool {
    offered.iter().any(|version| version == ROOM_SIGNAL_VERSION)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedProtocol {
    pub offered: Vec<String>,
}

impl fmt::Display for UnsupportedProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unsupported client protocol. server: {}. client: {}",
            SUPPORTED_VERSIONS.join(","),
            self.offered.join(",")
        )
    }
}

impl std::error::Error for UnsupportedProtocol {}

/// Selects the protocol version for a connection.
pub fn select_protocol_version(offered: &[String]) -> Result<&'static str, UnsupportedProtocol> {
    for offered_range in offered {
        let Ok(offered_req) = VersionReq::parse(offered_range) else {
            continue;
        };

        for supported in SUPPORTED_VERSIONS {
            let Ok(supported_req) = VersionReq::parse(supported) else {
                continue;
            };

            if ranges_intersect(&supported_req, &offered_req) {
                return Ok(supported);
            }
        }
    }

    Err(UnsupportedProtocol { offered: offered.to_vec() })
}

/// Whether some version satisfies both ranges. Pre-release tags take part
/// in bound comparison only.
pub fn ranges_intersect(left: &VersionReq, right: &VersionReq) -> bool {
    range_of(left).intersect(&range_of(right)).is_satisfiable()
}

#[derive(Debug, Clone)]
struct Bound {
    version: Version,
    inclusive: bool,
}

#[derive(Debug, Clone, Default)]
struct Range {
    lower: Option<Bound>,
    upper: Option<Bound>,
}

impl Range {
    fn intersect(&self, other: &Range) -> Range {
        Range {
            lower: tighter(self.lower.as_ref(), other.lower.as_ref(), Ordering::Greater),
            upper: tighter(self.upper.as_ref(), other.upper.as_ref(), Ordering::Less),
        }
    }

    /// A range no version satisfies, such as `>N` with `N` at `u64::MAX`.
    fn empty() -> Range {
        let zero = Version::new(0, 0, 0);
        Range {
            lower: Some(Bound { version: zero.clone(), inclusive: false }),
            upper: Some(Bound { version: zero, inclusive: false }),
        }
    }

    fn is_satisfiable(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Some(lower), Some(upper)) => match lower.version.cmp(&upper.version) {
                Ordering::Less => true,
                Ordering::Equal => lower.inclusive && upper.inclusive,
                Ordering::Greater => false,
            },
            _ => true,
        }
    }
}

/// Picks the more restrictive of two bounds; `prefer` is the ordering that
/// makes a bound tighter (greater for lower bounds, less for upper bounds).
fn tighter(left: Option<&Bound>, right: Option<&Bound>, prefer: Ordering) -> Option<Bound> {
    match (left, right) {
        (None, None) => None,
        (Some(bound), None) | (None, Some(bound)) => Some(bound.clone()),
        (Some(left), Some(right)) => match left.version.cmp(&right.version) {
            ordering if ordering == prefer => Some(left.clone()),
            Ordering::Equal => Some(Bound {
                version: left.version.clone(),
                inclusive: left.inclusive && right.inclusive,
            }),
            _ => Some(right.clone()),
        },
    }
}

fn range_of(req: &VersionReq) -> Range {
    req.comparators
        .iter()
        .map(comparator_range)
        .fold(Range::default(), |acc, range| acc.intersect(&range))
}

fn comparator_range(comparator: &Comparator) -> Range {
    let major = comparator.major;
    let minor = comparator.minor;
    let patch = comparator.patch;
    let mut floor = Version::new(major, minor.unwrap_or(0), patch.unwrap_or(0));
    floor.pre = comparator.pre.clone();

    // First version above the partially specified one (`1.2` -> `1.3.0`).
    // `None` when even the major component overflows.
    let next_partial = match (minor, patch) {
        (None, _) => bump_major(major),
        (Some(minor), None) => bump_minor(major, minor),
        (Some(minor), Some(patch)) => bump_patch(major, minor, patch),
    };

    let at_least = |version: Version| Some(Bound { version, inclusive: true });
    let below = |version: Option<Version>| version.map(|version| Bound { version, inclusive: false });

    match comparator.op {
        Op::Exact | Op::Wildcard => match patch {
            Some(_) => Range {
                lower: at_least(floor.clone()),
                upper: Some(Bound { version: floor, inclusive: true }),
            },
            None => Range { lower: at_least(floor), upper: below(next_partial) },
        },
        Op::Greater => match patch {
            Some(_) => Range { lower: Some(Bound { version: floor, inclusive: false }), upper: None },
            None => match next_partial {
                Some(next) => Range { lower: at_least(next), upper: None },
                None => Range::empty(),
            },
        },
        Op::GreaterEq => Range { lower: at_least(floor), upper: None },
        Op::Less => Range { lower: None, upper: below(Some(floor)) },
        Op::LessEq => match patch {
            Some(_) => Range { lower: None, upper: Some(Bound { version: floor, inclusive: true }) },
            None => Range { lower: None, upper: below(next_partial) },
        },
        Op::Tilde => {
            let upper = match minor {
                Some(minor) => bump_minor(major, minor),
                None => bump_major(major),
            };
            Range { lower: at_least(floor), upper: below(upper) }
        }
        Op::Caret => {
            let upper = match (major, minor, patch) {
                (0, Some(0), Some(patch)) => bump_patch(0, 0, patch),
                (0, Some(minor), _) => bump_minor(0, minor),
                _ => bump_major(major),
            };
            Range { lower: at_least(floor), upper: below(upper) }
        }
        _ => Range::default(),
    }
}

fn bump_major(major: u64) -> Option<Version> {
    major.checked_add(1).map(|major| Version::new(major, 0, 0))
}

// An overflowing component carries into the one above it.
fn bump_minor(major: u64, minor: u64) -> Option<Version> {
    match minor.checked_add(1) {
        Some(minor) => Some(Version::new(major, minor, 0)),
        None => bump_major(major),
    }
}

fn bump_patch(major: u64, minor: u64, patch: u64) -> Option<Version> {
    match patch.checked_add(1) {
        Some(patch) => Some(Version::new(major, minor, patch)),
        None => bump_minor(major, minor),
    }
}
