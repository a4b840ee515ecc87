//! # echem_demux
//!
//! echem_demux is the data path of the automated electrodeposition/characterization
//! platform, written in Rust. A potentiostat executes a list of electrochemical techniques
//! (OCV, CV, PEIS, CP, LP, CA) and streams back one interleaved sequence of measurement
//! samples. echem_demux splits that stream back into one ordered table per technique
//! execution and writes each table to disk exactly once.
//!
//! ## Building & Install
//!
//! To build and install the CLI use `cargo install --path ./echem_demux_cli` from the top
//! level repository. The library has no system dependencies.
//!
//! ## How the stream is split
//!
//! Every sample carries the technique-run id assigned by the instrument (the index of the
//! technique in the submitted list). A change of run id closes the open batch and opens a new
//! one. Some instrument restarts replay a technique without incrementing the run id; those are
//! recognized by the `time` field jumping backwards by more than `restart_threshold` seconds
//! while the run id stays constant. When that happens the batch is closed and the numbering
//! offset is advanced so the replayed technique does not collide with the previous output.
//!
//! Each closed batch gets a global sequence id (`offset + flush count`) and is handed to a
//! [`sink::PersistenceSink`]. The bundled [`csv_writer::CsvSink`] writes
//! `<experiment_id>_<sequence_id>_<KIND>.csv`, with a header made of every field that arrived
//! in the batch.
//!
//! ## Configuration
//!
//! Experiments are described by a YAML file. A template can be generated with
//! `echem_demux_cli -p config.yml new`. The format is:
//!
//! ```yml
//! experiment_id: auto
//! run_number: '001'
//! data_path: data
//! cell: C5
//! notes: ''
//! port: USB0
//! channel: 1
//! max_attempts: 3
//! retry_delay_secs: 50
//! restart_threshold: 2.0
//! flush_on_failure: false
//! background_writer: false
//! jobs:
//! - name: deposition
//!   directory: deposition
//!   techniques:
//!   - kind: ocv
//!     rest_time: 60.0
//!     record_every_dt: 0.5
//!   - kind: cp
//!     current: -0.002
//!     duration: 60.0
//!     record_every_dt: 0.1
//! ```
//!
//! An `experiment_id` of `auto` becomes `YYYYMMDD_<run_number>`. Jobs writing into the same
//! directory continue each other's sequence numbering.
//!
//! ## Output
//!
//! ```text
//! <data_path>/<experiment_id>
//! |---- metadata.json - date, time, runNumber, experimentID, cell, notes, status, batches
//! |---- deposition
//! |    |---- <experiment_id>_0_OCV.csv
//! |    |---- <experiment_id>_1_CP.csv
//! |---- characterization
//! |    |---- <experiment_id>_0_OCV.csv
//! |    |---- ...
//! ```
pub mod batch;
pub mod batch_accumulator;
pub mod boundary_detector;
pub mod config;
pub mod constants;
pub mod csv_writer;
pub mod error;
pub mod instrument;
pub mod metadata;
pub mod orchestrator;
pub mod sample;
pub mod sequencer;
pub mod simulated;
pub mod sink;
pub mod technique;
pub mod worker_status;
pub mod writer_thread;
