// Copyright 2023 Google LLC
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

use std::time;

/// How long an accept loop or a per-connection read loop blocks before
/// polling again to check for a shutdown request.
pub const POLL_TIMEOUT: time::Duration = time::Duration::from_millis(200);

/// Read buffer size for a single connection's socket reads.
pub const BUF_SIZE: usize = 1024 * 16;
