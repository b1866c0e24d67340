/*
 * Copyright (C) 2025 The Nspool Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::fmt;

pub type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Debug)]
struct ContextError {
    context: String,
    source: BoxError,
}

impl ContextError {
    fn new(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            context: context.into(),
            source: source.into(),
        }
    }
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.source)
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[derive(Debug)]
struct SimpleError(String);

impl fmt::Display for SimpleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for SimpleError {}

pub fn with_context<E>(error: E, context: impl Into<String>) -> BoxError
where
    E: Into<BoxError>,
{
    Box::new(ContextError::new(context, error))
}

pub fn new_error(message: impl Into<String>) -> BoxError {
    Box::new(SimpleError(message.into()))
}

/// Accumulator for best-effort teardown paths where every failure should be
/// reported but none should stop the remaining work.
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<BoxError>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: BoxError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn into_result(self) -> Result<(), BoxError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Box::new(CompositeError(
                self.errors.iter().map(|e| e.to_string()).collect(),
            )))
        }
    }
}

#[derive(Debug)]
struct CompositeError(Vec<String>);

impl fmt::Display for CompositeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("; "))
    }
}

impl Error for CompositeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_chains_are_displayed_outermost_first() {
        let inner = new_error("permission denied");
        let wrapped = with_context(inner, "failed to open namespace file");
        assert_eq!(
            wrapped.to_string(),
            "failed to open namespace file: permission denied"
        );
        assert!(wrapped.source().is_some());
    }

    #[test]
    fn error_list_joins_all_failures() {
        let mut list = ErrorList::new();
        assert!(list.is_empty());
        list.push(new_error("first"));
        list.push(new_error("second"));
        let err = list.into_result().unwrap_err();
        assert_eq!(err.to_string(), "first; second");
    }

    #[test]
    fn empty_error_list_is_ok() {
        assert!(ErrorList::new().into_result().is_ok());
    }
}
