// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Rest frequencies of the molecular transitions commonly targeted in band 6
//! disk observations.

/// One molecular transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub species: &'static str,
    pub transition: &'static str,
    pub rest_freq_hz: f64,
}

impl Transition {
    /// The catalog key, e.g. "12CO_2-1".
    pub fn name(&self) -> String {
        format!("{}_{}", self.species, self.transition)
    }
}

lazy_static::lazy_static! {
    /// The transition catalog. Rest frequencies from the usual spectroscopy
    /// databases, in Hz.
    pub static ref TRANSITIONS: Vec<Transition> = vec![
        Transition { species: "12CO",  transition: "2-1",         rest_freq_hz: 230.538_000_0e9 },
        Transition { species: "13CO",  transition: "2-1",         rest_freq_hz: 220.398_684_2e9 },
        Transition { species: "C18O",  transition: "2-1",         rest_freq_hz: 219.560_354_1e9 },
        Transition { species: "SO",    transition: "6(5)-5(4)",   rest_freq_hz: 219.949_442_0e9 },
        Transition { species: "H2CO",  transition: "3(0,3)-2(0,2)", rest_freq_hz: 218.222_192_0e9 },
        Transition { species: "H2CO",  transition: "3(2,1)-2(2,0)", rest_freq_hz: 218.760_066_0e9 },
        Transition { species: "DCN",   transition: "3-2",         rest_freq_hz: 217.238_530_0e9 },
        Transition { species: "SiO",   transition: "5-4",         rest_freq_hz: 217.104_980_0e9 },
    ];
}

/// Look a transition up by its catalog key.
pub fn lookup(name: &str) -> Option<&'static Transition> {
    TRANSITIONS.iter().find(|t| t.name() == name)
}
