// Copyright 2022 Elemental contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// library used by `elemental`

pub mod action;
pub mod blockdev;
pub mod bootloader;
pub mod bootmode;
pub mod cmdline;
pub mod config;
pub mod http;
pub mod partitioner;
pub mod snapshotter;
pub mod source;
pub mod state;
pub mod util;

#[cfg(test)]
pub mod testing;
