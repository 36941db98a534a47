use flate2::read::GzDecoder;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

///
/// Open a file for reading, and return a buffered reader
/// * `input_file` - file name--either gzipped or not
///
pub fn open_buf_reader<P: AsRef<Path>>(input_file: P) -> anyhow::Result<Box<dyn BufRead>> {
    let path = input_file.as_ref();
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", path.display(), e))?;
    match path.extension().and_then(|x| x.to_str()) {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

///
/// Open a file for writing, and return a buffered writer
/// * `output_file` - file name--either gzipped or not
///
pub fn open_buf_writer<P: AsRef<Path>>(output_file: P) -> anyhow::Result<Box<dyn Write>> {
    let path = output_file.as_ref();
    let file = File::create(path)
        .map_err(|e| anyhow::anyhow!("failed to create {}: {}", path.display(), e))?;
    match path.extension().and_then(|x| x.to_str()) {
        Some("gz") => Ok(Box::new(BufWriter::new(flate2::write::GzEncoder::new(
            file,
            flate2::Compression::default(),
        )))),
        _ => Ok(Box::new(BufWriter::new(file))),
    }
}

///
/// Write every line into the output_file
///
/// * `lines` - vector of lines
/// * `output_file` - file name--either gzipped or not
///
pub fn write_lines<T, P>(lines: &[T], output_file: P) -> anyhow::Result<()>
where
    T: std::fmt::Display,
    P: AsRef<Path>,
{
    let mut buf = open_buf_writer(output_file)?;
    for line in lines {
        writeln!(buf, "{}", line)?;
    }
    buf.flush()?;
    Ok(())
}

///
/// Read lines, skip comments (`#`, `%`) and blank lines, and split
/// each line by any of `delim` in parallel.
///
/// # Returns `(line_number, words)` in file order; line numbers are
/// 1-based for error messages
///
pub fn read_lines_of_words_delim<P: AsRef<Path>>(
    input_file: P,
    delim: &[char],
) -> anyhow::Result<Vec<(usize, Vec<Box<str>>)>> {
    let buf = open_buf_reader(input_file)?;

    let raw: Vec<(usize, String)> = buf
        .lines()
        .enumerate()
        .map(|(i, line)| line.map(|l| (i + 1, l)))
        .collect::<std::io::Result<_>>()?;

    // Parsing takes more time, so split them into parallel jobs
    Ok(raw
        .par_iter()
        .filter(|(_, l)| {
            let l = l.trim();
            !(l.is_empty() || l.starts_with('#') || l.starts_with('%'))
        })
        .map(|(i, l)| {
            let words = l
                .trim()
                .split(delim)
                .filter(|w| !w.is_empty())
                .map(|w| w.to_owned().into_boxed_str())
                .collect();
            (*i, words)
        })
        .collect())
}

///
/// Create a directory if needed
/// * `dir` - directory name
///
pub fn mkdir<P: AsRef<Path>>(dir: P) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir.as_ref())?;
    Ok(())
}

/// Find `<dir>/<stem>.tsv.gz` or `<dir>/<stem>.tsv`
pub fn find_tsv(dir: &Path, stem: &str) -> Option<std::path::PathBuf> {
    [format!("{}.tsv.gz", stem), format!("{}.tsv", stem)]
        .into_iter()
        .map(|f| dir.join(f))
        .find(|p| p.exists())
}
