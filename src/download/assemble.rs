use std::io::Cursor;

use image::{imageops, DynamicImage, ImageFormat, RgbaImage};

use crate::download::metadata::TileGrid;
use crate::download::tile::Tile;
use crate::error::{DriveError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFrame {
    pub frame_index: usize,
    /// PNG encoded.
    pub image_bytes: Vec<u8>,
}

/// Stitches the tiles of one frame into a single PNG.
///
/// Tiles in the same row must share a height and tiles in the same column a
/// width, so that the grid lines up without gaps or overlaps.
pub fn assemble_frame(frame_index: usize, grid: TileGrid, tiles: Vec<Tile>) -> Result<AssembledFrame> {
    let fail = |reason: String| DriveError::AssemblyError { frame: frame_index, reason };

    if tiles.len() != grid.tile_count() {
        return Err(fail(format!(
            "expected {} tiles for a {}x{} grid, got {}",
            grid.tile_count(),
            grid.rows,
            grid.cols,
            tiles.len()
        )));
    }

    let cols = grid.cols as usize;
    let mut slots: Vec<Option<RgbaImage>> = vec![None; grid.tile_count()];

    for tile in tiles {
        if tile.frame_index != frame_index {
            return Err(fail(format!("received a tile of frame {}", tile.frame_index)));
        }
        if tile.row >= grid.rows || tile.col >= grid.cols {
            return Err(fail(format!("tile r{}c{} lies outside the grid", tile.row, tile.col)));
        }

        let slot = &mut slots[tile.row as usize * cols + tile.col as usize];
        if slot.is_some() {
            return Err(fail(format!("tile r{}c{} received twice", tile.row, tile.col)));
        }

        let decoded = image::load_from_memory(&tile.raw_bytes)
            .map_err(|err| fail(format!("tile r{}c{} is not a readable image: {}", tile.row, tile.col, err)))?;
        *slot = Some(decoded.to_rgba8());
    }

    // the count check plus the duplicate check leave no slot empty
    let images = slots.into_iter().flatten().collect::<Vec<_>>();
    let at = |row: usize, col: usize| &images[row * cols + col];

    let col_widths = (0..cols).map(|col| at(0, col).width()).collect::<Vec<_>>();
    let row_heights = (0..grid.rows as usize).map(|row| at(row, 0).height()).collect::<Vec<_>>();

    for row in 0..grid.rows as usize {
        for col in 0..cols {
            let tile = at(row, col);
            if tile.width() != col_widths[col] || tile.height() != row_heights[row] {
                return Err(fail(format!(
                    "tile r{}c{} is {}x{}, the grid expects {}x{}",
                    row,
                    col,
                    tile.width(),
                    tile.height(),
                    col_widths[col],
                    row_heights[row]
                )));
            }
        }
    }

    let width = col_widths.iter().sum::<u32>();
    let height = row_heights.iter().sum::<u32>();
    let mut canvas = RgbaImage::new(width, height);

    let mut y = 0;
    for (row, row_height) in row_heights.iter().enumerate() {
        let mut x = 0;
        for (col, col_width) in col_widths.iter().enumerate() {
            imageops::replace(&mut canvas, at(row, col), x as i64, y as i64);
            x += col_width;
        }
        y += row_height;
    }

    let mut image_bytes = Vec::new();
    DynamicImage::ImageRgba8(canvas)
        .write_to(&mut Cursor::new(&mut image_bytes), ImageFormat::Png)
        .map_err(|err| fail(format!("cannot encode frame: {}", err)))?;

    Ok(AssembledFrame { frame_index, image_bytes })
}

#[cfg(test)]
pub(crate) mod tests {
    use bytes::Bytes;
    use image::{GenericImageView, Rgba};

    use super::*;

    /// A solid `width`x`height` PNG whose color encodes `(frame, row, col)`.
    pub(crate) fn tile_png(frame: usize, row: u32, col: u32, width: u32, height: u32) -> Bytes {
        let image = RgbaImage::from_pixel(width, height, tile_color(frame, row, col));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        Bytes::from(bytes)
    }

    pub(crate) fn tile_color(frame: usize, row: u32, col: u32) -> Rgba<u8> {
        Rgba([frame as u8, row as u8 * 40, col as u8 * 40, 255])
    }

    fn tiles(frame: usize, grid: TileGrid, width: u32, height: u32) -> Vec<Tile> {
        grid.positions()
            .map(|(row, col)| Tile { frame_index: frame, row, col, raw_bytes: tile_png(frame, row, col, width, height) })
            .collect()
    }

    #[test]
    fn tiles_land_in_row_major_positions() {
        let grid = TileGrid { rows: 3, cols: 3 };
        let mut shuffled = tiles(7, grid, 4, 2);
        shuffled.reverse();

        let frame = assemble_frame(7, grid, shuffled).unwrap();
        let image = image::load_from_memory(&frame.image_bytes).unwrap();

        assert_eq!(frame.frame_index, 7);
        assert_eq!(image.dimensions(), (12, 6));
        for (row, col) in grid.positions() {
            let pixel = image.get_pixel(col * 4 + 3, row * 2 + 1);
            assert_eq!(pixel, tile_color(7, row, col), "tile r{}c{}", row, col);
        }
    }

    #[test]
    fn missing_tile_is_an_assembly_error() {
        let grid = TileGrid { rows: 3, cols: 3 };
        let mut eight = tiles(2, grid, 4, 4);
        eight.pop();

        let err = assemble_frame(2, grid, eight).unwrap_err();
        assert!(matches!(err, DriveError::AssemblyError { frame: 2, .. }), "{}", err);
    }

    #[test]
    fn misaligned_tile_is_an_assembly_error() {
        let grid = TileGrid { rows: 2, cols: 2 };
        let mut tiles = tiles(0, grid, 4, 4);
        tiles[3].raw_bytes = tile_png(0, 1, 1, 5, 4);

        let err = assemble_frame(0, grid, tiles).unwrap_err();
        assert!(matches!(err, DriveError::AssemblyError { frame: 0, ref reason } if reason.contains("r1c1")));
    }

    #[test]
    fn duplicate_and_foreign_tiles_are_rejected() {
        let grid = TileGrid { rows: 1, cols: 2 };
        let mut doubled = tiles(1, grid, 2, 2);
        doubled[1] = doubled[0].clone();
        assert!(matches!(assemble_frame(1, grid, doubled), Err(DriveError::AssemblyError { .. })));

        let foreign = tiles(9, grid, 2, 2);
        assert!(matches!(assemble_frame(1, grid, foreign), Err(DriveError::AssemblyError { .. })));
    }

    #[test]
    fn undecodable_tile_is_an_assembly_error() {
        let grid = TileGrid::SINGLE;
        let garbage = vec![Tile { frame_index: 0, row: 0, col: 0, raw_bytes: Bytes::from_static(b"<html>") }];
        assert!(matches!(assemble_frame(0, grid, garbage), Err(DriveError::AssemblyError { .. })));
    }
}
