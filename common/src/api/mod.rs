// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data structures and related facilities shared by every component

mod artifact;
mod error;
mod instance;
mod message;

pub use artifact::*;
pub use error::*;
pub use instance::*;
pub use message::*;
