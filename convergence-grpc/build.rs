// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::io::Result;

fn main() -> Result<()> {
    tonic_build::configure().compile(&["proto/worker.proto"], &["proto"])?;
    Ok(())
}
