//! # Filters
//!
//! A filter conjoins optional constraints on id prefixes, author prefixes,
//! kinds, single-letter tag values, a `[since, until]` time window, and a
//! result limit. A filter group is a disjunction of filters: a packed event
//! matches the group iff it matches any filter.
//!
//! Matching operates on the packed event view only; nothing here re-parses
//! JSON. The query scheduler additionally uses the parsed constraints to pick
//! an index access path, but correctness never depends on that choice because
//! every candidate row is re-checked with [`Filter::matches`].

use serde_json::Value;

use crate::error::{Error, Result};
use crate::event::PackedEvent;

// =============================================================================
// Prefixes
// =============================================================================

/// A hex-decoded prefix of a 32-byte identifier (event id or pubkey).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix(Vec<u8>);

impl Prefix {
    pub fn parse(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::proto("prefix is not valid hex"))?;
        if bytes.is_empty() || bytes.len() > 32 {
            return Err(Error::proto("prefix has invalid length"));
        }
        Ok(Self(bytes))
    }

    pub fn matches(&self, full: &[u8]) -> bool {
        full.starts_with(&self.0)
    }

    /// Inclusive lower bound of the 32-byte range this prefix covers.
    pub fn range_lo(&self) -> [u8; 32] {
        let mut lo = [0u8; 32];
        lo[..self.0.len()].copy_from_slice(&self.0);
        lo
    }

    /// Inclusive upper bound of the 32-byte range this prefix covers.
    pub fn range_hi(&self) -> [u8; 32] {
        let mut hi = [0xFFu8; 32];
        hi[..self.0.len()].copy_from_slice(&self.0);
        hi
    }
}

// =============================================================================
// Filter
// =============================================================================

/// One conjunction of constraints. Empty lists mean "unconstrained".
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub ids: Vec<Prefix>,
    pub authors: Vec<Prefix>,
    pub kinds: Vec<u64>,
    /// Tag constraints keyed by tag letter, e.g. `#e` becomes `(b'e', [...])`.
    pub tags: Vec<(u8, Vec<String>)>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    /// Parses a filter object. When `max_limit` is given, the effective limit
    /// is clamped to it (and defaults to it when absent).
    pub fn from_json(v: &Value, max_limit: Option<usize>) -> Result<Self> {
        let obj = v
            .as_object()
            .ok_or_else(|| Error::proto("filter is not an object"))?;

        let mut filter = Filter::default();

        for (key, value) in obj {
            match key.as_str() {
                "ids" => filter.ids = prefix_list(value, "ids")?,
                "authors" => filter.authors = prefix_list(value, "authors")?,
                "kinds" => {
                    let arr = value
                        .as_array()
                        .ok_or_else(|| Error::proto("kinds is not an array"))?;
                    filter.kinds = arr
                        .iter()
                        .map(|k| k.as_u64().ok_or_else(|| Error::proto("kind is not a number")))
                        .collect::<Result<_>>()?;
                }
                "since" => {
                    filter.since =
                        Some(value.as_u64().ok_or_else(|| Error::proto("since is not a number"))?)
                }
                "until" => {
                    filter.until =
                        Some(value.as_u64().ok_or_else(|| Error::proto("until is not a number"))?)
                }
                "limit" => {
                    filter.limit = Some(
                        value.as_u64().ok_or_else(|| Error::proto("limit is not a number"))?
                            as usize,
                    )
                }
                k if k.starts_with('#') && k.len() == 2 => {
                    let letter = k.as_bytes()[1];
                    let arr = value
                        .as_array()
                        .ok_or_else(|| Error::proto("tag filter is not an array"))?;
                    let values = arr
                        .iter()
                        .map(|s| {
                            s.as_str()
                                .map(str::to_string)
                                .ok_or_else(|| Error::proto("tag filter value is not a string"))
                        })
                        .collect::<Result<_>>()?;
                    filter.tags.push((letter, values));
                }
                // Unknown keys are ignored so newer clients keep working.
                _ => {}
            }
        }

        if let Some(max) = max_limit {
            filter.limit = Some(filter.limit.map_or(max, |l| l.min(max)));
        }

        Ok(filter)
    }

    /// Whether all present constraints hold for the packed event.
    pub fn matches(&self, ev: &PackedEvent<'_>) -> bool {
        if let Some(since) = self.since {
            if ev.created_at() < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if ev.created_at() > until {
                return false;
            }
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&ev.kind()) {
            return false;
        }
        if !self.ids.is_empty() && !self.ids.iter().any(|p| p.matches(ev.id())) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.iter().any(|p| p.matches(ev.pubkey())) {
            return false;
        }
        for (letter, values) in &self.tags {
            let found = ev.tags().any(|(l, v)| {
                l == *letter && values.iter().any(|want| want.as_bytes() == v)
            });
            if !found {
                return false;
            }
        }
        true
    }
}

fn prefix_list(value: &Value, what: &str) -> Result<Vec<Prefix>> {
    let arr = value
        .as_array()
        .ok_or_else(|| Error::proto(format!("{what} is not an array")))?;
    arr.iter()
        .map(|s| {
            let s = s
                .as_str()
                .ok_or_else(|| Error::proto(format!("{what} element is not a string")))?;
            Prefix::parse(s)
        })
        .collect()
}

// =============================================================================
// Filter Group
// =============================================================================

/// Disjunction of filters, as carried by one `REQ`.
#[derive(Debug, Clone)]
pub struct FilterGroup(Vec<Filter>);

impl FilterGroup {
    /// Builds a group from the filter elements of a `REQ` array (everything
    /// after the subscription id).
    pub fn from_req(filters: &[Value]) -> Result<Self> {
        let parsed = filters
            .iter()
            .map(|f| Filter::from_json(f, None))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(parsed))
    }

    /// Builds a single-filter group from a bare filter object, clamping the
    /// limit. Used by reconciliation sessions.
    pub fn unwrapped(filter: &Value, max_limit: usize) -> Result<Self> {
        Ok(Self(vec![Filter::from_json(filter, Some(max_limit))?]))
    }

    pub fn filters(&self) -> &[Filter] {
        &self.0
    }

    pub fn matches(&self, ev: &PackedEvent<'_>) -> bool {
        self.0.iter().any(|f| f.matches(ev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    fn packed_event(kind: u64, created_at: u64, tags: Vec<Vec<String>>) -> Vec<u8> {
        Event {
            id: [0xAB; 32],
            pubkey: [0xCD; 32],
            created_at,
            kind,
            tags,
            content: String::new(),
            sig: [0; 64],
        }
        .pack()
    }

    #[test]
    fn kind_and_window_constraints() {
        let packed = packed_event(1, 500, vec![]);
        let ev = PackedEvent::new(&packed);

        let f: Filter =
            Filter::from_json(&serde_json::json!({"kinds": [1, 7], "since": 400, "until": 600}), None)
                .unwrap();
        assert!(f.matches(&ev));

        let f = Filter::from_json(&serde_json::json!({"kinds": [2]}), None).unwrap();
        assert!(!f.matches(&ev));

        let f = Filter::from_json(&serde_json::json!({"since": 501}), None).unwrap();
        assert!(!f.matches(&ev));
    }

    #[test]
    fn prefix_constraints() {
        let packed = packed_event(1, 500, vec![]);
        let ev = PackedEvent::new(&packed);

        let f = Filter::from_json(&serde_json::json!({"ids": ["abab"]}), None).unwrap();
        assert!(f.matches(&ev));

        let f = Filter::from_json(&serde_json::json!({"authors": ["cd", "0000"]}), None).unwrap();
        assert!(f.matches(&ev));

        let f = Filter::from_json(&serde_json::json!({"ids": ["ff"]}), None).unwrap();
        assert!(!f.matches(&ev));

        assert!(Filter::from_json(&serde_json::json!({"ids": ["xyz"]}), None).is_err());
    }

    #[test]
    fn tag_constraints_use_packed_tags() {
        let packed = packed_event(
            1,
            500,
            vec![
                vec!["e".to_string(), "cafe".to_string()],
                vec!["p".to_string(), "beef".to_string()],
            ],
        );
        let ev = PackedEvent::new(&packed);

        let f = Filter::from_json(&serde_json::json!({"#e": ["cafe", "f00d"]}), None).unwrap();
        assert!(f.matches(&ev));

        let f = Filter::from_json(&serde_json::json!({"#e": ["f00d"]}), None).unwrap();
        assert!(!f.matches(&ev));

        let f =
            Filter::from_json(&serde_json::json!({"#e": ["cafe"], "#p": ["dead"]}), None).unwrap();
        assert!(!f.matches(&ev));
    }

    #[test]
    fn group_is_a_disjunction() {
        let packed = packed_event(7, 500, vec![]);
        let ev = PackedEvent::new(&packed);

        let group = FilterGroup::from_req(&[
            serde_json::json!({"kinds": [1]}),
            serde_json::json!({"kinds": [7]}),
        ])
        .unwrap();
        assert!(group.matches(&ev));
    }

    #[test]
    fn unwrapped_clamps_limit() {
        let group =
            FilterGroup::unwrapped(&serde_json::json!({"limit": 1_000_000}), 50).unwrap();
        assert_eq!(group.filters()[0].limit, Some(50));

        let group = FilterGroup::unwrapped(&serde_json::json!({}), 50).unwrap();
        assert_eq!(group.filters()[0].limit, Some(50));
    }

    #[test]
    fn prefix_range_bounds() {
        let p = Prefix::parse("ab").unwrap();
        assert_eq!(p.range_lo()[0], 0xAB);
        assert_eq!(p.range_lo()[1], 0x00);
        assert_eq!(p.range_hi()[0], 0xAB);
        assert_eq!(p.range_hi()[1], 0xFF);
    }
}
