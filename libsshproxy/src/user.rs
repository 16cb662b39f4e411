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

/*! Resolves the caller's login name and group memberships so the
configuration engine can match `users`/`groups` predicates. */

use std::{ffi::CStr, io, ptr};

use anyhow::anyhow;
use nix::unistd::{getgroups, Gid, Group};

#[derive(Debug)]
pub struct Info {
    pub user: String,
    pub home_dir: String,
    pub groups: Vec<String>,
}

/// Resolves the info of the process's real uid, the identity sshd set up
/// for this forced-command invocation.
pub fn info() -> anyhow::Result<Info> {
    let (user, home_dir) = passwd_info()?;
    let groups = group_names()?;
    Ok(Info { user, home_dir, groups })
}

fn passwd_info() -> anyhow::Result<(String, String)> {
    let mut passwd_str_buf: [libc::c_char; 1024 * 4] = [0; 1024 * 4];
    let mut passwd = libc::passwd {
        pw_name: ptr::null_mut(),
        pw_passwd: ptr::null_mut(),
        pw_uid: 0,
        pw_gid: 0,
        pw_gecos: ptr::null_mut(),
        pw_dir: ptr::null_mut(),
        pw_shell: ptr::null_mut(),
    };
    let mut passwd_res_ptr: *mut libc::passwd = ptr::null_mut();
    unsafe {
        // Safety: pretty much pure ffi, passwd and passwd_str_buf correctly
        //         have memory backing them.
        let errno = libc::getpwuid_r(
            libc::getuid(),
            &mut passwd,
            passwd_str_buf.as_mut_ptr(),
            passwd_str_buf.len(),
            &mut passwd_res_ptr as *mut *mut libc::passwd,
        );
        if passwd_res_ptr.is_null() {
            if errno == 0 {
                return Err(anyhow!("could not find current user, should be impossible"));
            } else {
                return Err(anyhow!(
                    "error resolving user info: {}",
                    io::Error::from_raw_os_error(errno)
                ));
            }
        }

        // Safety: these pointers are all cstrings
        Ok((
            String::from(String::from_utf8_lossy(CStr::from_ptr(passwd.pw_name).to_bytes())),
            String::from(String::from_utf8_lossy(CStr::from_ptr(passwd.pw_dir).to_bytes())),
        ))
    }
}

/// Resolves the supplementary group list of the calling process into
/// group names, for the config engine's `groups` predicate.
fn group_names() -> anyhow::Result<Vec<String>> {
    let gids: Vec<Gid> = getgroups().map_err(|e| anyhow!("getgroups: {}", e))?;
    let mut names = Vec::with_capacity(gids.len());
    for gid in gids {
        if let Some(group) = Group::from_gid(gid).map_err(|e| anyhow!("looking up gid {}: {}", gid, e))? {
            names.push(group.name);
        }
    }
    Ok(names)
}
