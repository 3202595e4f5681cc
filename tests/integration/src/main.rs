mod helpers;

mod cluster;
mod persistence;
