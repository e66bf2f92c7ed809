// Consolidated reports from the job logs that the periodic analyses produce.  The job logs are read
// and cleaned up by `joblog`, `jobstate` keeps track of which jobs have been reported, and the
// report commands combine the two.

pub mod cpuhog;
pub mod deadweight;
pub mod joblog;
pub mod jobstate;
pub mod options;
