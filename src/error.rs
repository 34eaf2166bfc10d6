/*
Copyright 2024 The lxe Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The backend has no sandbox or container with the given id. Stop and
    /// remove verbs recover from this locally, everything else surfaces it.
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}: not implemented")]
    NotImplemented(&'static str),
    #[error("unknown network plugin {0}")]
    UnknownNetworkPlugin(String),
    #[error("invalid argument {0}")]
    InvalidArgument(String),
    #[error("command exited with code {code}")]
    ExecFailed {
        code: i32,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn exec_failed(code: i32, source: anyhow::Error) -> Self {
        Error::ExecFailed { code, source }
    }
}

impl From<Error> for tonic::Status {
    fn from(e: Error) -> Self {
        match &e {
            Error::NotFound(_) => tonic::Status::not_found(e.to_string()),
            Error::NotImplemented(_) => tonic::Status::unimplemented(e.to_string()),
            Error::UnknownNetworkPlugin(_) | Error::InvalidArgument(_) => {
                tonic::Status::invalid_argument(e.to_string())
            }
            _ => tonic::Status::internal(format!("{:#}", anyhow::Error::from(e))),
        }
    }
}
