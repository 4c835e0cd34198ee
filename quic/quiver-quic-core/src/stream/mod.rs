// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod id;
pub mod state;

pub use id::{StreamId, StreamType};
