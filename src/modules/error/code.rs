//
// Copyright (c) 2026 whippet.dev (https://whippet.dev)
//
// This file is part of the Whippet Mail Search Project
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.


#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ErrorCode {
    // Configuration errors (10000–10999)
    InvalidSetting = 10000,
    MissingConfiguration = 10020,

    // Backend lifecycle errors (20000–20999)
    BackendInitFailed = 20000,

    // Network connection errors (40000–40999)
    NetworkError = 40000,
    HttpResponseError = 40030,
    TransportClosed = 40040,

    // Internal system errors (70000–70999)
    InternalError = 70000,
    IoError = 70020,
}
