// Copyright 2026 Palisade Authors
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

//! palisade: coordination layer for a native request-inspection engine.
//!
//! This library owns the lifecycle of a WAF-style rule matcher: it
//! hot-swaps rule configuration while concurrent requests are evaluated
//! against the current handle, runs per-request evaluations with timeout
//! and error containment, classifies outcomes into a closed result type,
//! and throttles how often matched events are reported upstream.

pub mod config;
pub mod engine;
pub mod errors;
pub mod native;
pub mod rate_limiter;
pub mod result;
pub mod telemetry;
