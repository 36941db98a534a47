pub mod cohort; // labelled patients with sparse visit records
pub mod common_io; // gz-aware line readers and writers
pub mod ehr_data_loader; // fold partitions and episode sampling
pub mod episode;
pub mod folds; // stratified splits and seed streams
pub mod simulate; // synthetic cohorts
pub mod subset;
