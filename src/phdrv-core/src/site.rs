// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Per-site population bookkeeping.

use std::fmt;

use serde::Serialize;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SitePopulation {
    Empty,
    Populated,
    Deactivated,
    /// A unit arrived on a site the host switched off.
    PopulatedDeactivated,
    /// The unit was probed before and is not tested again.
    PopulatedReprobed,
}

impl SitePopulation {
    pub fn has_unit(self) -> bool {
        matches!(
            self,
            Self::Populated | Self::PopulatedDeactivated | Self::PopulatedReprobed
        )
    }
}

impl fmt::Display for SitePopulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Empty => "empty",
            Self::Populated => "populated",
            Self::Deactivated => "deactivated",
            Self::PopulatedDeactivated => "populated (deactivated)",
            Self::PopulatedReprobed => "populated (already probed)",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteRecord {
    pub id: String,
    pub active: bool,
    pub population: SitePopulation,
    /// The device reports a unit waiting on this site.
    pub pending: bool,
    /// A unit is expected on this site at the next acquire.
    pub expected: bool,
    /// The last dispose sent this site's unit for reprobe.
    pub reprobe: bool,
}

impl SiteRecord {
    pub fn new(id: impl Into<String>, active: bool) -> Self {
        Self {
            id: id.into(),
            active,
            population: if active {
                SitePopulation::Empty
            } else {
                SitePopulation::Deactivated
            },
            pending: false,
            expected: false,
            reprobe: false,
        }
    }

    fn idle_population(&self) -> SitePopulation {
        if self.active {
            SitePopulation::Empty
        } else {
            SitePopulation::Deactivated
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SiteTable {
    sites: Vec<SiteRecord>,
}

impl SiteTable {
    pub fn new<S: AsRef<str>>(ids: &[S], inactive: &[S]) -> Self {
        let sites = ids
            .iter()
            .map(|id| {
                let id = id.as_ref();
                let active = !inactive.iter().any(|off| off.as_ref() == id);
                SiteRecord::new(id, active)
            })
            .collect();
        Self { sites }
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn records(&self) -> &[SiteRecord] {
        &self.sites
    }

    pub fn iter(&self) -> impl Iterator<Item = &SiteRecord> {
        self.sites.iter()
    }

    pub fn get(&self, index: usize) -> Option<&SiteRecord> {
        self.sites.get(index)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.sites.iter().position(|s| s.id == id)
    }

    /// Returns false for an unknown index.
    pub fn set_active(&mut self, index: usize, active: bool) -> bool {
        let Some(site) = self.sites.get_mut(index) else {
            return false;
        };
        site.active = active;
        if !site.population.has_unit() {
            site.population = site.idle_population();
        }
        true
    }

    pub fn any_pending(&self) -> bool {
        self.sites.iter().any(|s| s.pending)
    }

    pub fn any_reprobe(&self) -> bool {
        self.sites.iter().any(|s| s.reprobe)
    }

    pub fn set_pending(&mut self, index: usize, pending: bool) {
        if let Some(site) = self.sites.get_mut(index) {
            site.pending = pending;
        }
    }

    /// Mark every site whose bit is set in `mask` as pending. Bits beyond
    /// the configured sites are returned.
    pub fn apply_mask(&mut self, mask: u64) -> u64 {
        for (i, site) in self.sites.iter_mut().enumerate().take(64) {
            if mask & (1 << i) != 0 {
                site.pending = true;
            }
        }
        let known = match self.sites.len() {
            n if n >= 64 => u64::MAX,
            n => (1u64 << n) - 1,
        };
        mask & !known
    }

    /// Expect a unit on every active site at the next acquire.
    pub fn expect_active(&mut self) {
        for site in &mut self.sites {
            site.expected = site.active;
        }
    }

    pub fn request_reprobe(&mut self, index: usize) {
        if let Some(site) = self.sites.get_mut(index) {
            site.reprobe = true;
        }
    }

    /// Turn pending units into the population of a freshly acquired unit.
    /// After a dispose that reprobed some sites, the returned units are
    /// checked against the reprobe requests instead.
    pub fn accept_pending(&mut self) {
        let reprobing = self.any_reprobe();
        for site in &mut self.sites {
            if !site.active {
                if site.pending {
                    error!("unit delivered to deactivated site {}", site.id);
                    site.population = SitePopulation::PopulatedDeactivated;
                } else {
                    site.population = SitePopulation::Deactivated;
                }
                site.pending = false;
            } else if reprobing {
                Self::accept_reprobed(site);
            } else {
                if site.expected && !site.pending {
                    warn!("no unit delivered to site {}", site.id);
                }
                site.population = if site.pending {
                    SitePopulation::Populated
                } else {
                    SitePopulation::Empty
                };
                site.pending = false;
            }
            site.reprobe = false;
        }
    }

    fn accept_reprobed(site: &mut SiteRecord) {
        let had_unit = site.population.has_unit();
        match (site.reprobe, site.pending, had_unit) {
            (true, true, true) => {
                site.population = SitePopulation::Populated;
                site.pending = false;
            }
            (true, false, true) => {
                error!(
                    "site {} did not return its unit for reprobe, treating it as empty",
                    site.id
                );
                site.population = SitePopulation::Empty;
            }
            (true, _, false) => {
                warn!("site {} was sent for reprobe without a unit", site.id);
                site.pending = false;
            }
            (false, true, _) => {
                warn!("site {} delivered a delayed unit, keeping it pending", site.id);
                site.population = SitePopulation::Empty;
            }
            (false, false, _) => {
                site.population = site.idle_population();
            }
        }
    }

    /// Units leave their sites once binned; sites sent for reprobe keep
    /// theirs.
    pub fn after_bin(&mut self) {
        for site in &mut self.sites {
            if site.reprobe {
                continue;
            }
            site.population = match site.population {
                SitePopulation::Populated | SitePopulation::PopulatedReprobed => {
                    SitePopulation::Empty
                }
                SitePopulation::PopulatedDeactivated => SitePopulation::Deactivated,
                other => other,
            };
        }
    }

    pub fn mark_reprobed(&mut self, index: usize) {
        if let Some(site) = self.sites.get_mut(index) {
            if site.population == SitePopulation::Populated {
                site.population = SitePopulation::PopulatedReprobed;
            }
        }
    }

    /// Forget everything known about the sites.
    pub fn clear_population(&mut self) {
        for site in &mut self.sites {
            site.population = site.idle_population();
            site.pending = false;
            site.expected = false;
            site.reprobe = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(n: usize) -> SiteTable {
        let ids: Vec<String> = (1..=n).map(|i| i.to_string()).collect();
        SiteTable::new(&ids, &[])
    }

    fn populations(t: &SiteTable) -> Vec<SitePopulation> {
        t.iter().map(|s| s.population).collect()
    }

    #[test]
    fn test_inactive_sites_start_deactivated() {
        let t = SiteTable::new(&["A", "B"], &["B"]);
        assert_eq!(
            populations(&t),
            vec![SitePopulation::Empty, SitePopulation::Deactivated]
        );
        assert_eq!(t.index_of("B"), Some(1));
    }

    #[test]
    fn test_apply_mask_reports_unknown_bits() {
        let mut t = table(2);
        assert_eq!(t.apply_mask(0b0110), 0b0100);
        assert!(!t.get(0).unwrap().pending);
        assert!(t.get(1).unwrap().pending);
        assert!(t.any_pending());
    }

    #[test]
    fn test_accept_pending() {
        let mut t = SiteTable::new(&["1", "2", "3"], &["3"]);
        t.expect_active();
        t.apply_mask(0b101);
        t.accept_pending();
        assert_eq!(
            populations(&t),
            vec![
                SitePopulation::Populated,
                SitePopulation::Empty,
                SitePopulation::PopulatedDeactivated
            ]
        );
        assert!(!t.any_pending());

        t.after_bin();
        assert_eq!(
            populations(&t),
            vec![
                SitePopulation::Empty,
                SitePopulation::Empty,
                SitePopulation::Deactivated
            ]
        );
    }

    #[test]
    fn test_reprobe_return_rules() {
        let mut t = table(4);
        t.apply_mask(0b1111);
        t.accept_pending();

        // sites 1 and 2 go to reprobe, 3 and 4 are binned
        t.request_reprobe(0);
        t.request_reprobe(1);
        t.after_bin();
        assert_eq!(t.get(0).unwrap().population, SitePopulation::Populated);
        assert_eq!(t.get(2).unwrap().population, SitePopulation::Empty);

        // site 1 comes back, site 2 does not, site 4 delivers early
        t.apply_mask(0b1001);
        t.accept_pending();
        assert_eq!(
            populations(&t),
            vec![
                SitePopulation::Populated,
                SitePopulation::Empty,
                SitePopulation::Empty,
                SitePopulation::Empty
            ]
        );
        assert!(t.get(3).unwrap().pending);
        assert!(!t.any_reprobe());

        // the delayed unit is taken at the following acquire
        t.after_bin();
        t.accept_pending();
        assert_eq!(t.get(3).unwrap().population, SitePopulation::Populated);
    }

    #[test]
    fn test_set_active_and_clear() {
        let mut t = table(2);
        assert!(t.set_active(1, false));
        assert!(!t.set_active(5, false));
        assert_eq!(t.get(1).unwrap().population, SitePopulation::Deactivated);

        t.apply_mask(0b01);
        t.accept_pending();
        t.mark_reprobed(0);
        assert_eq!(
            t.get(0).unwrap().population,
            SitePopulation::PopulatedReprobed
        );
        t.clear_population();
        assert_eq!(
            populations(&t),
            vec![SitePopulation::Empty, SitePopulation::Deactivated]
        );
    }
}
