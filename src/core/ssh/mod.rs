mod client;

pub use client::{
    execute_local_command, is_local_host, SshAuth, SshClient, SshSessionFactory,
};
