pub mod springboard;
