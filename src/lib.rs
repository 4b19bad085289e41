pub mod bencode;
pub mod blockinfo;
pub mod collaborators;
pub mod conf;
pub mod disk;
pub mod error;
pub mod merkle;
pub mod metainfo;
pub mod peer;
pub mod picker;
pub mod pool;
pub mod download;
pub mod storage_info;
pub mod tracker;
pub mod torrent;
pub mod transport;
pub mod engine;

pub mod avg;
pub mod counter;
pub mod alert;

mod define;
pub use define::*;
