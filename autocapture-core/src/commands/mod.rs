pub mod backup;
pub mod compact;
pub mod derive;
pub mod export;
pub mod keys;
pub mod recover;
pub mod replay;
pub mod verify;
