// SPDX-License-Identifier: Apache-2.0

pub mod bounded_channel;
pub mod harvester;
pub mod init;
pub mod prospector;
pub mod publisher;
pub mod registrar;
