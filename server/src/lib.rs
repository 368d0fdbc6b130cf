// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

mod app;
pub mod config;

pub use app::{Application, ApplicationError, BuildError};
pub use config::{load_configuration, ConfigLoadError, DB_CONNECTION_STRING_ENV};
