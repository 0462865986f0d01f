// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::errors::{ClientError, ErrorKind, Result};

pub(super) async fn io_with_timeout<F, T>(
    label: &'static str,
    fut: F,
    io_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => {
            Err(ClientError::new(ErrorKind::Canceled, format!("{label} cancelled")))
        }
        res = tokio::time::timeout(io_timeout, fut) => {
            match res {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(ClientError::new(
                    ErrorKind::Timeout,
                    format!("{label} timeout"),
                )),
            }
        }
    }
}
