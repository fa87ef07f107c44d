/******************************************************************************
*
*  Copyright 2023 Stefan Majewsky <majewsky@gmx.net>
*
*  Licensed under the Apache License, Version 2.0 (the "License");
*  you may not use this file except in compliance with the License.
*  You may obtain a copy of the License at
*
*      http://www.apache.org/licenses/LICENSE-2.0
*
*  Unless required by applicable law or agreed to in writing, software
*  distributed under the License is distributed on an "AS IS" BASIS,
*  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
*  See the License for the specific language governing permissions and
*  limitations under the License.
*
******************************************************************************/

use std::fmt;
use thiserror::Error;

/// Malformed input data. These are surfaced to the caller and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("expecting to find {attribute} in {target}: the request is malformed or otherwise incorrect")]
    MissingAttribute {
        attribute: String,
        target: String,
    },
    #[error("string length exceeded: the length of {string:?} exceeds the limit of column {column} (CHAR({length}))")]
    StringLengthExceeded {
        string: String,
        column: String,
        length: usize,
    },
}

/// An internal failure. The detail message is only shown when debug detail has been enabled, to
/// avoid leaking internals to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct UnexpectedError {
    detail: String,
    show_detail: bool,
}

impl UnexpectedError {
    pub fn new(detail: impl Into<String>) -> Self {
        UnexpectedError {
            detail: detail.into(),
            show_detail: false,
        }
    }

    /// Controls whether [Display][fmt::Display] includes the detail message.
    #[must_use]
    pub fn with_detail_shown(mut self, show_detail: bool) -> Self {
        self.show_detail = show_detail;
        self
    }

    /// Returns the detail message regardless of the debug setting, e.g. for logging.
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl fmt::Display for UnexpectedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an unexpected error prevented the server from fulfilling your request")?;
        if self.show_detail {
            write!(
                f,
                ": {} (Disable debug mode to suppress these details.)",
                self.detail
            )?;
        }
        Ok(())
    }
}
