//! # missionlink-transport
//!
//! ミッションのフィールド単位分割と再組み立て、データグラム変換を担当する。
//!
//! ## 分割の単位
//!
//! ```text
//! MissionPayload ─ to_fields ─▶ [Field][Field][Field(大)]
//!                                        │
//!                    split_field ────────┘ (F を超える Field だけパートに分ける)
//!                                        ▼
//!                  [Field Field][Field part0][part1][part2 Field]
//!                   Fragment #0  Fragment #1  ...     Fragment #n
//! ```
//!
//! 受信側は Fragment を順不同・重複ありで受け取り、名前とパート番号で
//! 元のフィールドを復元する。到着済み seq は `FragmentWindow` で追跡する。

pub mod error;
pub mod fragment;
pub mod packet;
pub mod window;

pub use error::TransportError;
pub use fragment::{FieldAssembly, Fragment, Fragmenter};
pub use packet::{Packet, MAX_DATAGRAM_LEN};
pub use window::FragmentWindow;
