//! Routing rules shared by push, invoke, and gather dispatch
//!
//! Pure functions over [`Location`]: no session state, no IO. The session
//! applies these to decide which peer groups see a message.

use crate::location::Location;

/// Rewrite render-server bits onto the data-server group when no separate
/// render cluster exists. With a render group present the mask passes
/// through unchanged.
pub fn reroute(location: Location, has_render_group: bool) -> Location {
    if has_render_group {
        return location;
    }
    let mut location = location;
    if location.contains(Location::RENDER_SERVER) {
        location = location
            .insert(Location::DATA_SERVER)
            .remove(Location::RENDER_SERVER);
    }
    if location.contains(Location::RENDER_SERVER_ROOT) {
        location = location
            .insert(Location::DATA_SERVER_ROOT)
            .remove(Location::RENDER_SERVER_ROOT);
    }
    location
}

/// Destinations selected for a broadcast-style dispatch. A message may
/// target several destinations at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Targets {
    pub client: bool,
    pub data: bool,
    pub render: bool,
}

/// Which destinations a (rewritten) location addresses.
pub fn targets(location: Location) -> Targets {
    Targets {
        client: location.targets_client(),
        data: location.targets_data(),
        render: location.targets_render(),
    }
}

/// The single remote group a gather call queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherTarget {
    Data,
    Render,
}

/// Select the one remote group for a gather. Data bits take priority over
/// render bits when both are set; render is only selectable when a render
/// group exists. Expects `location` to already be rewritten via [`reroute`].
pub fn gather_target(location: Location, has_render_group: bool) -> Option<GatherTarget> {
    if location.targets_data() {
        Some(GatherTarget::Data)
    } else if has_render_group && location.targets_render() {
        Some(GatherTarget::Render)
    } else {
        None
    }
}
