// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::Result;
use async_trait::async_trait;

/// Components that can flatten themselves to a serializable state record and
/// be reconstructed from one.
#[async_trait]
pub trait Persist
where
    Self: Sized,
{
    /// The type of the object representing the state of the component.
    type State;
    /// The type of the object holding the constructor arguments.
    type ConstructorArgs;

    /// Returns the current state of the component.
    async fn save(&self) -> Result<Self::State>;
    /// Constructs a component from a specified state.
    async fn restore(constructor_args: Self::ConstructorArgs, state: Self::State) -> Result<Self>;
}
