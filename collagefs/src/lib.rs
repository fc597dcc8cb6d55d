// Library crate for CollageFS: a chunked filesystem engine whose file data
// lives in a remote blob store and is cached locally in a bounded chunk cache.
// 二进制入口见 main.rs；集成测试直接驱动 daemon::Engine。

pub mod cadapter;
pub mod chuck;
pub mod config;
pub mod daemon;
pub mod meta;
pub mod vfs;
