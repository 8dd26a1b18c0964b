// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User provided dropshot server context

use std::sync::Arc;

use crate::state::State;

/// Cheaply cloneable; each dropshot server gets its own copy.
#[derive(Clone)]
pub struct ServerContext {
    pub(crate) state: Arc<State>,
}
