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

//! The `nsexec` sub-mode: the daemon re-execs itself here to run a
//! namespace function inside a fresh (CREATE) or joined (ENTER) namespace.
//! The result goes to stdout as `(ret|err):<decimal-length>,<payload>`; on
//! success the child then blocks on stdin until the parent has opened the
//! namespace file and sends the release line.

use nix::sched::{setns, unshare};
use std::env;
use std::fs::File;
use std::io::{self, BufRead, Write};

use crate::nspool::api::types::NamespaceType;
use crate::nspool::namespace::{
    clone_flag, NsFunctionArgs, NsFunctionKey, NsFunctionRegistry, ERROR_PREFIX,
    NSEXEC_NS_PATH_ENV, NSEXEC_NS_TYPE_ENV, NSEXEC_OP_CREATE, NSEXEC_OP_ENTER, NSEXEC_OP_ENV,
    RETURN_PREFIX,
};
use crate::nspool::util::error::{new_error, with_context, BoxError};

use super::NsexecArgs;

pub fn run(args: &NsexecArgs, registry: &NsFunctionRegistry) -> i32 {
    match execute(args, registry) {
        Ok(payload) => {
            if let Err(e) = emit(RETURN_PREFIX, &payload) {
                eprintln!("nsexec: failed to write result: {}", e);
                return 1;
            }
            // hold the namespace open until the parent has its fd
            let mut line = String::new();
            let _ = io::stdin().lock().read_line(&mut line);
            0
        }
        Err(e) => {
            let message = e.to_string();
            let _ = emit(ERROR_PREFIX, message.as_bytes());
            1
        }
    }
}

fn execute(args: &NsexecArgs, registry: &NsFunctionRegistry) -> Result<Vec<u8>, BoxError> {
    let op = env::var(NSEXEC_OP_ENV)
        .map_err(|_| new_error(format!("{} must be set", NSEXEC_OP_ENV)))?;
    let ns_type_name = env::var(NSEXEC_NS_TYPE_ENV)
        .map_err(|_| new_error(format!("{} must be set", NSEXEC_NS_TYPE_ENV)))?;
    let t = NamespaceType::parse(&ns_type_name)
        .ok_or_else(|| new_error(format!("invalid namespace type {}", ns_type_name)))?;
    if t.as_str() != args.ns_type {
        return Err(new_error(format!(
            "namespace type mismatch: {} on the command line, {} in the environment",
            args.ns_type, ns_type_name
        )));
    }
    let flag = clone_flag(t)?;

    match op.as_str() {
        NSEXEC_OP_ENTER => {
            let path = env::var(NSEXEC_NS_PATH_ENV)
                .map_err(|_| new_error(format!("{} must be set for ENTER", NSEXEC_NS_PATH_ENV)))?;
            let file = File::open(&path)
                .map_err(|e| with_context(e, format!("failed to open {}", path)))?;
            setns(&file, flag).map_err(|e| with_context(e, format!("setns to {} failed", path)))?;
        }
        NSEXEC_OP_CREATE => {
            unshare(flag).map_err(|e| with_context(e, format!("unshare({}) failed", t)))?;
        }
        other => return Err(new_error(format!("invalid operation type {}", other))),
    }

    if args.function_key.is_empty() {
        return Ok(Vec::new());
    }
    let key = NsFunctionKey::parse(&args.function_key)
        .ok_or_else(|| new_error(format!("unknown function key {}", args.function_key)))?;
    let function = registry
        .get(key, t)
        .ok_or_else(|| new_error(format!("no function registered for ({}, {})", key, t)))?;
    function(&function_args(args))
}

fn function_args(args: &NsexecArgs) -> NsFunctionArgs {
    let mut map = NsFunctionArgs::new();
    if let Some(src) = &args.src {
        map.insert("src".to_string(), src.clone());
    }
    if let Some(bundle) = &args.bundle {
        map.insert("bundle".to_string(), bundle.clone());
    }
    if let Some(checkpoint) = &args.checkpoint {
        map.insert("checkpoint".to_string(), checkpoint.clone());
    }
    map
}

fn emit(prefix: &[u8; 4], payload: &[u8]) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(prefix)?;
    stdout.write_all(format!("{},", payload.len()).as_bytes())?;
    stdout.write_all(payload)?;
    stdout.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_args_only_carry_provided_options() {
        let args = NsexecArgs {
            src: Some("/lower".into()),
            bundle: None,
            checkpoint: Some("/cp".into()),
            function_key: "create".into(),
            ns_type: "mnt".into(),
        };
        let map = function_args(&args);
        assert_eq!(map.get("src").map(String::as_str), Some("/lower"));
        assert_eq!(map.get("checkpoint").map(String::as_str), Some("/cp"));
        assert!(!map.contains_key("bundle"));
    }
}
